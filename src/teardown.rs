//! End-of-run cleanup.
//!
//! Every step is best-effort: failures are logged and counted, and the next
//! step still runs.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::process::Cmd;
use crate::status::StatusLog;

/// Control over the OS service scheduler that started this run.
pub trait ServiceManager {
    /// Unload the user-session agent from the console user's domain.
    fn remove_agent(&self, uid: u32, agent_id: &str) -> Result<()>;
    /// Unload the privileged daemon.
    fn remove_daemon(&self, daemon_id: &str) -> Result<()>;
    fn reboot(&self) -> Result<()>;
}

/// `launchctl(1)` / `shutdown(8)` backed implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Launchctl;

impl ServiceManager for Launchctl {
    fn remove_agent(&self, uid: u32, agent_id: &str) -> Result<()> {
        Cmd::new("/bin/launchctl")
            .args(["asuser", &uid.to_string(), "/bin/launchctl", "remove", agent_id])
            .error_msg(format!("failed to remove agent {}", agent_id))
            .run()?;
        Ok(())
    }

    fn remove_daemon(&self, daemon_id: &str) -> Result<()> {
        Cmd::new("/bin/launchctl")
            .args(["remove", daemon_id])
            .error_msg(format!("failed to remove daemon {}", daemon_id))
            .run()?;
        Ok(())
    }

    fn reboot(&self) -> Result<()> {
        Cmd::new("/sbin/shutdown")
            .args(["-r", "now"])
            .error_msg("failed to trigger reboot")
            .run()?;
        Ok(())
    }
}

/// What teardown managed to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub steps: usize,
    pub failed: Vec<String>,
}

impl TeardownReport {
    fn step(&mut self, name: &str, result: Result<()>) {
        self.steps += 1;
        match result {
            Ok(()) => info!(step = name, "teardown step done"),
            Err(e) => {
                warn!(step = name, "teardown step failed: {:#}", e);
                self.failed.push(name.to_string());
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))
}

fn remove_tree(path: &Path) -> Result<()> {
    fs::remove_dir_all(path).with_context(|| format!("Failed to remove {}", path.display()))
}

/// Remove scheduling entries and working state, then reboot or unload.
///
/// `console_uid` is the uid of the console user, if one is logged in.
pub fn teardown(
    config: &RunConfig,
    services: &dyn ServiceManager,
    console_uid: Option<u32>,
    status: &StatusLog,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    if config.dry_run {
        info!(
            daemon = %config.daemon_plist().display(),
            agent = %config.agent_plist().display(),
            "Dry run: leaving scheduling entries in place"
        );
    } else {
        report.step("remove daemon plist", remove_file(&config.daemon_plist()));
        report.step("remove agent plist", remove_file(&config.agent_plist()));
        info!(agent = %config.agent_id, "Removing LaunchAgent from launchctl list");
        let agent = match console_uid {
            Some(uid) => services.remove_agent(uid, &config.agent_id),
            None => Err(anyhow::anyhow!("no console user to remove the agent for")),
        };
        report.step("unload agent", agent);
    }

    report.step("remove working directory", remove_tree(&config.work_dir));
    report.step("remove flag directory", remove_tree(&config.flag_dir));

    status.send_all(&config.notify.completion);

    if config.dry_run {
        info!(reboot = config.reboot, "Dry run: skipping reboot / daemon unload");
    } else if config.reboot {
        report.step("reboot", services.reboot());
    } else {
        info!(daemon = %config.daemon_id, "Removing LaunchDaemon from launchctl list");
        report.step("unload daemon", services.remove_daemon(&config.daemon_id));
    }

    report
}
