//! Bootstrap manifest: stages of items to download, install and run.
//!
//! The manifest is a JSON object mapping a stage name to an ordered list of
//! items. It is parsed once per run and never mutated afterwards. Items that
//! don't validate are kept in place as [`InvalidItem`] so the scheduler can
//! log and skip them without losing their position.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::error::{BootstrapError, BootstrapResult};

/// Execution stage. Stages always run in [`Stage::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Runs before anyone logs in. Nothing here may need a user session.
    PreSession,
    /// Runs once a real user is (or will be) at the console.
    SessionBound,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::PreSession, Stage::SessionBound];

    /// Canonical manifest key.
    pub fn key(self) -> &'static str {
        match self {
            Self::PreSession => "pre-session",
            Self::SessionBound => "session-bound",
        }
    }

    /// Older manifests use these names for the same stages.
    fn legacy_key(self) -> &'static str {
        match self {
            Self::PreSession => "setupassistant",
            Self::SessionBound => "userland",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.key() == key || stage.legacy_key() == key)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Where an item comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub url: String,
    pub hash: String,
}

/// Type-specific part of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Package { package_id: String, version: String },
    RootScript { wait_for_completion: bool },
    UserScript,
}

impl ItemKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Package { .. } => "package",
            Self::RootScript { .. } => "rootscript",
            Self::UserScript => "userscript",
        }
    }
}

/// A validated manifest item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    pub file: PathBuf,
    /// `None` means the file is expected to be staged already.
    pub source: Option<Source>,
    pub kind: ItemKind,
}

/// Why an item was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("unknown item type '{0}'")]
    UnknownType(String),
    #[error("'url' given without a 'hash'")]
    UrlWithoutHash,
    #[error("item is not a well-formed object: {0}")]
    Malformed(String),
}

/// An item that failed validation, kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidItem {
    /// Position within its stage.
    pub index: usize,
    pub reason: InvalidReason,
    /// Compact JSON of the offending entry.
    pub raw: String,
}

/// One slot in a stage's item list.
pub type Entry = Result<Item, InvalidItem>;

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    file: Option<PathBuf>,
    url: Option<String>,
    hash: Option<String>,
    #[serde(rename = "packageID", alias = "packageid", alias = "packageId")]
    package_id: Option<String>,
    version: Option<String>,
    #[serde(rename = "waitForCompletion")]
    wait_for_completion: Option<bool>,
    donotwait: Option<bool>,
}

impl RawItem {
    fn validate(self) -> Result<Item, InvalidReason> {
        let file = self.file.ok_or(InvalidReason::MissingKey("file"))?;
        let name = self.name.ok_or(InvalidReason::MissingKey("name"))?;
        let kind = self.kind.ok_or(InvalidReason::MissingKey("type"))?;

        let kind = match kind.as_str() {
            "package" => ItemKind::Package {
                package_id: self
                    .package_id
                    .ok_or(InvalidReason::MissingKey("packageID"))?,
                version: self.version.ok_or(InvalidReason::MissingKey("version"))?,
            },
            "rootscript" => ItemKind::RootScript {
                wait_for_completion: self
                    .wait_for_completion
                    .or(self.donotwait.map(|d| !d))
                    .unwrap_or(true),
            },
            "userscript" => ItemKind::UserScript,
            other => return Err(InvalidReason::UnknownType(other.to_string())),
        };

        let source = match (self.url, self.hash) {
            (Some(url), Some(hash)) => Some(Source { url, hash }),
            (Some(_), None) => return Err(InvalidReason::UrlWithoutHash),
            (None, _) => None,
        };

        Ok(Item {
            name,
            file,
            source,
            kind,
        })
    }
}

fn parse_entry(index: usize, value: serde_json::Value) -> Entry {
    let raw = value.to_string();
    serde_json::from_value::<RawItem>(value)
        .map_err(|e| InvalidReason::Malformed(e.to_string()))
        .and_then(RawItem::validate)
        .map_err(|reason| InvalidItem { index, reason, raw })
}

/// Parsed bootstrap manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    stages: BTreeMap<Stage, Vec<Entry>>,
}

impl Manifest {
    /// Build from an already-decoded JSON document.
    ///
    /// Returns `None` if the top level is not an object or a known stage is
    /// not an array. Unknown keys are logged and ignored whatever their
    /// value; absent stages are empty.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(map) = value else {
            return None;
        };

        let mut stages = BTreeMap::new();
        for (key, items) in map {
            let Some(stage) = Stage::from_key(&key) else {
                warn!(stage = %key, "ignoring unknown stage in manifest");
                continue;
            };
            let serde_json::Value::Array(items) = items else {
                return None;
            };
            let entries = items
                .into_iter()
                .enumerate()
                .map(|(index, value)| parse_entry(index, value))
                .collect();
            stages.insert(stage, entries);
        }

        Some(Self { stages })
    }

    /// Read and parse the manifest cached at `path`.
    pub fn load(path: &Path) -> BootstrapResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| BootstrapError::ManifestRead {
            path: path.to_path_buf(),
            source,
        })?;
        let value = serde_json::from_str(&text).map_err(|source| BootstrapError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(value).ok_or_else(|| BootstrapError::ManifestShape {
            path: path.to_path_buf(),
        })
    }

    /// Items of `stage` in manifest order.
    pub fn entries(&self, stage: Stage) -> &[Entry] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of entries (valid or not) in `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        self.entries(stage).len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.values().all(Vec::is_empty)
    }
}
