//! Package installation through the OS installer.
//!
//! `installed_version` never fails: a missing or unreadable receipt is the
//! normal "not installed yet" case and reports [`DottedVersion::NOT_INSTALLED`].

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::process::Cmd;
use crate::version::DottedVersion;

pub const DEFAULT_INSTALLER: &str = "/usr/sbin/installer";
pub const DEFAULT_PKGUTIL: &str = "/usr/sbin/pkgutil";

/// Install packages and read their receipts.
pub trait PackageInstaller {
    /// Version recorded in the receipt database for `package_id`.
    fn installed_version(&self, package_id: &str) -> String;

    /// Install the package at `path` onto the root volume, returning the
    /// installer's exit code. `Err` means the installer couldn't be started.
    fn install(&self, path: &Path) -> Result<i32>;
}

/// `installer(8)` and `pkgutil(1)` backed implementation.
#[derive(Debug, Clone)]
pub struct SystemInstaller {
    installer: PathBuf,
    pkgutil: PathBuf,
    dry_run: bool,
}

impl SystemInstaller {
    pub fn new(dry_run: bool) -> Self {
        Self {
            installer: PathBuf::from(DEFAULT_INSTALLER),
            pkgutil: PathBuf::from(DEFAULT_PKGUTIL),
            dry_run,
        }
    }

    /// Override the tool locations.
    pub fn with_tools(mut self, installer: impl Into<PathBuf>, pkgutil: impl Into<PathBuf>) -> Self {
        self.installer = installer.into();
        self.pkgutil = pkgutil.into();
        self
    }
}

impl PackageInstaller for SystemInstaller {
    fn installed_version(&self, package_id: &str) -> String {
        let result = Cmd::new(&self.pkgutil)
            .args(["--pkg-info", package_id])
            .allow_fail()
            .run();

        match result {
            Ok(result) if result.success() => parse_pkg_info_version(&result.stdout)
                .unwrap_or_else(|| DottedVersion::NOT_INSTALLED.to_string()),
            Ok(_) => {
                debug!(package_id, "no receipt");
                DottedVersion::NOT_INSTALLED.to_string()
            }
            Err(e) => {
                debug!(package_id, error = %e, "receipt lookup failed");
                DottedVersion::NOT_INSTALLED.to_string()
            }
        }
    }

    fn install(&self, path: &Path) -> Result<i32> {
        if self.dry_run {
            info!(path = %path.display(), "Dry run installing package");
            return Ok(0);
        }

        let result = Cmd::new(&self.installer)
            .args(["-verboseR", "-pkg"])
            .arg_path(path)
            .args(["-target", "/"])
            .allow_fail()
            .run()?;

        for line in result.combined_lines() {
            info!(target: "installer", "{}", sanitize_log_line(line));
        }
        Ok(result.code())
    }
}

/// Pull `version: X` out of `pkgutil --pkg-info` output.
pub fn parse_pkg_info_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let value = value.trim();
        (key.trim() == "version" && !value.is_empty()).then(|| value.to_string())
    })
}

/// Make an installer output line safe for the log sink.
///
/// `%` becomes a space (format-string sinks choke on it), ellipses and
/// control characters are dropped.
pub fn sanitize_log_line(line: &str) -> String {
    line.chars()
        .filter(|c| *c != '\u{2026}' && (!c.is_control() || *c == '\t'))
        .map(|c| if c == '%' { ' ' } else { c })
        .collect()
}
