//! Run configuration.
//!
//! One explicit value built at startup from the command line (which also
//! reads `BOOTSTRAP_*` environment variables and `.env`) and handed to every
//! component. Nothing else carries run-wide state.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::status::{NotifyOptions, DEFAULT_STATUS_LOG};

pub const DEFAULT_WORK_DIR: &str = "/Library/Application Support/bootstrapper";
pub const DEFAULT_FLAG_DIR: &str = "/var/tmp/bootstrapper";
pub const DEFAULT_IDENTIFIER: &str = "com.github.bootstrapper";

pub const LAUNCH_DAEMONS_DIR: &str = "/Library/LaunchDaemons";
pub const LAUNCH_AGENTS_DIR: &str = "/Library/LaunchAgents";

const MANIFEST_FILE: &str = "bootstrap.json";
const USERSCRIPT_DIR: &str = "userscripts";
const USERSCRIPT_FLAG: &str = ".userscript";

/// Interval for rendezvous flag polling.
pub const DEFAULT_FLAG_POLL: Duration = Duration::from_millis(500);
/// Interval for console user polling.
pub const DEFAULT_CONSOLE_POLL: Duration = Duration::from_secs(1);

/// Everything a run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub manifest_url: Option<String>,
    /// Holds the cached manifest and the user-script queue.
    pub work_dir: PathBuf,
    /// Holds the rendezvous flag. Must be writable by the console user.
    pub flag_dir: PathBuf,
    pub daemon_id: String,
    pub agent_id: String,
    /// Sent as `Authorization: <value>` on every fetch.
    pub authorization: Option<String>,
    pub reboot: bool,
    pub dry_run: bool,
    pub notify: NotifyOptions,
    pub status_log: PathBuf,
    pub flag_poll: Duration,
    pub console_poll: Duration,
    pub settle: Duration,
    /// Where launchd plists live; overridable for tests.
    pub launch_daemons_dir: PathBuf,
    pub launch_agents_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            flag_dir: PathBuf::from(DEFAULT_FLAG_DIR),
            daemon_id: DEFAULT_IDENTIFIER.to_string(),
            agent_id: DEFAULT_IDENTIFIER.to_string(),
            authorization: None,
            reboot: false,
            dry_run: false,
            notify: NotifyOptions::default(),
            status_log: PathBuf::from(DEFAULT_STATUS_LOG),
            flag_poll: DEFAULT_FLAG_POLL,
            console_poll: DEFAULT_CONSOLE_POLL,
            settle: crate::download::DEFAULT_SETTLE,
            launch_daemons_dir: PathBuf::from(LAUNCH_DAEMONS_DIR),
            launch_agents_dir: PathBuf::from(LAUNCH_AGENTS_DIR),
        }
    }
}

impl RunConfig {
    /// Defaults rooted at the given working and flag directories.
    pub fn with_dirs(work_dir: impl Into<PathBuf>, flag_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            flag_dir: flag_dir.into(),
            ..Self::default()
        }
    }

    /// Cached manifest; the run's source of truth once present.
    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(MANIFEST_FILE)
    }

    pub fn userscript_dir(&self) -> PathBuf {
        self.work_dir.join(USERSCRIPT_DIR)
    }

    pub fn flag_path(&self) -> PathBuf {
        self.flag_dir.join(USERSCRIPT_FLAG)
    }

    pub fn daemon_plist(&self) -> PathBuf {
        plist_path(&self.launch_daemons_dir, &self.daemon_id)
    }

    pub fn agent_plist(&self) -> PathBuf {
        plist_path(&self.launch_agents_dir, &self.agent_id)
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!(
            manifest_url = self.manifest_url.as_deref().unwrap_or("<none>"),
            work_dir = %self.work_dir.display(),
            manifest = %self.manifest_path().display(),
            flag = %self.flag_path().display(),
            daemon = %self.daemon_plist().display(),
            agent = %self.agent_plist().display(),
            dry_run = self.dry_run,
            reboot = self.reboot,
            "configuration"
        );
    }
}

fn plist_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join(format!("{}.plist", identifier))
}
