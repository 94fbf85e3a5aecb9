//! Plain-text status log for the notification UI.
//!
//! The UI tails a file of `Key: value` lines (`Status: ...`,
//! `Command: Determinate: N`, `Command: Quit`, ...). Writing is best-effort:
//! a broken status log never affects the bootstrap itself.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lines that only make sense once the run is over, plus companion settings.
pub const COMPLETION_TRIGGERS: [&str; 6] = [
    "Command: Quit",
    "Command: Restart",
    "Command: Logout",
    "DEPNotifyPath",
    "DEPNotifyArguments",
    "DEPNotifySkipStatus",
];

const APP_PATH_KEY: &str = "DEPNotifyPath:";
const APP_ARGS_KEY: &str = "DEPNotifyArguments:";
const SKIP_STATUS_KEY: &str = "DEPNotifySkipStatus";

pub const DEFAULT_STATUS_LOG: &str = "/var/tmp/depnotify.log";

/// Notifier lines split by when they are delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOptions {
    /// Written as soon as the run starts.
    pub startup: Vec<String>,
    /// Held back until teardown.
    pub completion: Vec<String>,
    /// Companion app to launch in the user session.
    pub app_path: Option<String>,
    pub app_args: Option<String>,
    /// Per-item `Status:` lines and the item count.
    pub status_enabled: bool,
}

impl NotifyOptions {
    pub fn parse(lines: &[String]) -> Self {
        let mut opts = Self {
            status_enabled: true,
            ..Self::default()
        };

        for line in lines {
            if COMPLETION_TRIGGERS.iter().any(|t| line.contains(t)) {
                if line.contains(SKIP_STATUS_KEY) {
                    opts.status_enabled = false;
                }
                if line.contains(APP_PATH_KEY) {
                    opts.app_path = value_after_key(line);
                }
                if line.contains(APP_ARGS_KEY) {
                    opts.app_args = value_after_key(line);
                }
                opts.completion.push(line.clone());
            } else {
                opts.startup.push(line.clone());
            }
        }

        opts
    }

    pub fn is_empty(&self) -> bool {
        self.startup.is_empty() && self.completion.is_empty()
    }
}

fn value_after_key(line: &str) -> Option<String> {
    let (_, value) = line.split_once(' ')?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Appends lines to the status file, if one is configured.
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    path: Option<PathBuf>,
    status_enabled: bool,
}

impl StatusLog {
    /// A status log that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Status log at `path`; disabled when no notifier lines were given.
    pub fn new(path: &Path, opts: &NotifyOptions) -> Self {
        if opts.is_empty() {
            return Self::disabled();
        }
        Self {
            path: Some(path.to_path_buf()),
            status_enabled: opts.status_enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn status_enabled(&self) -> bool {
        self.is_enabled() && self.status_enabled
    }

    pub fn write_line(&self, line: &str) {
        let Some(ref path) = self.path else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", line));
        match written {
            Ok(()) => debug!(status_log = %path.display(), line, "status line written"),
            Err(e) => warn!(status_log = %path.display(), error = %e, "failed to write status line"),
        }
    }

    /// `Status: <text>`, unless per-item status is switched off.
    pub fn status(&self, text: &str) {
        if self.status_enabled() {
            self.write_line(&format!("Status: {}", text));
        }
    }

    /// `Command: Determinate: <steps>`, unless per-item status is switched off.
    pub fn determinate(&self, steps: usize) {
        if self.status_enabled() {
            self.write_line(&format!("Command: Determinate: {}", steps));
        }
    }

    pub fn send_all(&self, lines: &[String]) {
        if !self.is_enabled() {
            return;
        }
        for line in lines {
            info!("Sending {} to notifier", line);
            self.write_line(line);
        }
    }
}
