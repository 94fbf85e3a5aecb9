//! Preflight checks run before anything is downloaded.
//!
//! Missing manifest URL and missing privilege are fatal. Everything else is
//! reported and the run continues.

use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{BootstrapError, BootstrapResult};
use crate::process::{self, Cmd};

/// Result of a single non-fatal check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
}

impl CheckResult {
    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }

    fn log(&self) {
        let details = self.details.as_deref().unwrap_or("");
        match self.status {
            CheckStatus::Pass => info!(check = %self.name, "{}", details),
            CheckStatus::Warn => warn!(check = %self.name, "{}", details),
        }
    }
}

/// Effective uid as reported by `id -u`.
pub fn current_uid() -> Option<String> {
    let result = Cmd::new("id").arg("-u").allow_fail().run().ok()?;
    result
        .success()
        .then(|| result.stdout_trimmed().to_string())
}

/// Fatal unless running as root. Dry runs may run unprivileged.
pub fn check_privilege(uid: Option<&str>, dry_run: bool) -> BootstrapResult<()> {
    if dry_run || uid == Some("0") {
        return Ok(());
    }
    Err(BootstrapError::NotPrivileged {
        uid: uid.unwrap_or("unknown").to_string(),
    })
}

/// Fatal if there is no manifest URL to fetch from.
pub fn check_manifest_url(config: &RunConfig) -> BootstrapResult<&str> {
    match config.manifest_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(BootstrapError::MissingManifestUrl),
    }
}

/// Is the download transport installed?
pub fn check_transport(program: &str) -> CheckResult {
    match process::which(program) {
        Some(path) => CheckResult::pass_with("transport", &path.display().to_string()),
        None => CheckResult::warn(
            "transport",
            &format!("'{}' not found in PATH - downloads will fail", program),
        ),
    }
}

/// Run every check, failing on the first fatal one.
pub fn run(config: &RunConfig) -> BootstrapResult<Vec<CheckResult>> {
    check_manifest_url(config)?;
    check_privilege(current_uid().as_deref(), config.dry_run)?;

    let checks = vec![check_transport("curl")];
    for check in &checks {
        check.log();
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url_required() {
        let config = RunConfig::default();
        assert!(matches!(
            check_manifest_url(&config),
            Err(BootstrapError::MissingManifestUrl)
        ));

        let config = RunConfig {
            manifest_url: Some("  ".into()),
            ..RunConfig::default()
        };
        assert!(check_manifest_url(&config).is_err());

        let config = RunConfig {
            manifest_url: Some("https://h/bootstrap.json".into()),
            ..RunConfig::default()
        };
        assert_eq!(check_manifest_url(&config).unwrap(), "https://h/bootstrap.json");
    }

    #[test]
    fn test_privilege() {
        assert!(check_privilege(Some("0"), false).is_ok());
        assert!(check_privilege(Some("501"), true).is_ok());
        match check_privilege(Some("501"), false) {
            Err(BootstrapError::NotPrivileged { uid }) => assert_eq!(uid, "501"),
            other => panic!("expected NotPrivileged, got {:?}", other),
        }
        assert!(check_privilege(None, false).is_err());
    }

    #[test]
    fn test_current_uid_is_numeric() {
        let uid = current_uid().unwrap();
        assert!(uid.chars().all(|c| c.is_ascii_digit()), "{}", uid);
    }

    #[test]
    fn test_transport_check() {
        assert_eq!(check_transport("sh").status, CheckStatus::Pass);
        assert_eq!(
            check_transport("nonexistent_transport_12345").status,
            CheckStatus::Warn
        );
    }
}
