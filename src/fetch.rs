//! Fetch client.
//!
//! The transport itself (TLS, redirects, resume) belongs to curl. This module
//! only describes one fetch attempt and classifies what came back; retrying
//! is the job of [`crate::download`].

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::process::Cmd;

/// curl's exit code for "transferred a partial file".
const CURL_PARTIAL_FILE: i32 = 18;

/// One download request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Display label used in log lines.
    pub name: String,
    pub url: String,
    pub dest: PathBuf,
    /// Value for an `Authorization` header, if any.
    pub authorization: Option<String>,
}

impl FetchRequest {
    pub fn new(name: impl Into<String>, url: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            dest: dest.into(),
            authorization: None,
        }
    }

    pub fn with_authorization(mut self, value: Option<&str>) -> Self {
        self.authorization = value.map(str::to_string);
        self
    }
}

/// Result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete(PathBuf),
    Partial { path: PathBuf, bytes: u64 },
    TransportError(String),
}

/// Something that can move bytes from a URL to a local path.
pub trait Fetcher {
    fn fetch(&self, request: &FetchRequest) -> FetchOutcome;
}

/// Fetcher backed by the `curl` binary.
#[derive(Debug, Clone)]
pub struct CurlFetcher {
    program: PathBuf,
}

impl Default for CurlFetcher {
    fn default() -> Self {
        Self::new("curl")
    }
}

impl CurlFetcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &FetchRequest) -> Cmd {
        let mut cmd = Cmd::new(&self.program)
            .args(["--fail", "--silent", "--show-error", "--location", "--create-dirs"])
            .arg("--output")
            .arg_path(&request.dest);
        if let Some(ref auth) = request.authorization {
            cmd = cmd.arg("--header").arg(format!("Authorization: {}", auth));
        }
        cmd.arg(&request.url).allow_fail()
    }
}

impl Fetcher for CurlFetcher {
    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        info!(item = %request.name, url = %request.url, "Starting download");

        let result = match self.command(request).run() {
            Ok(result) => result,
            Err(e) => return FetchOutcome::TransportError(format!("{:#}", e)),
        };

        match result.code() {
            0 => {
                debug!(item = %request.name, path = %request.dest.display(), "download complete");
                FetchOutcome::Complete(request.dest.clone())
            }
            CURL_PARTIAL_FILE => {
                let bytes = file_len(&request.dest);
                warn!(item = %request.name, bytes, "partial download");
                FetchOutcome::Partial {
                    path: request.dest.clone(),
                    bytes,
                }
            }
            code => {
                let message = format!("curl exit code {}: {}", code, result.stderr_trimmed());
                warn!(item = %request.name, url = %request.url, "Error: {}", message);
                FetchOutcome::TransportError(message)
            }
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
