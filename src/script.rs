//! Script execution: privileged scripts and the user-session queue.
//!
//! Script failures are reported, never propagated: a broken script must not
//! stop the rest of the bootstrap.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::process::Cmd;

/// Runs one script.
pub trait ScriptExecutor {
    /// Run `path`. When `wait` is false, `true` means the child started.
    fn run(&self, path: &Path, wait: bool) -> bool;
}

/// Runs scripts as real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemScripts {
    dry_run: bool,
}

impl SystemScripts {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }
}

impl ScriptExecutor for SystemScripts {
    fn run(&self, path: &Path, wait: bool) -> bool {
        if self.dry_run {
            info!(script = %path.display(), "Dry run executing script");
            return true;
        }
        run_script(path, wait)
    }
}

/// Spawn `path` directly (it must be executable).
pub fn run_script(path: &Path, wait: bool) -> bool {
    info!(script = %path.display(), wait, "Running script");

    if !wait {
        return match Cmd::new(path).spawn() {
            // Fire and forget: the child is never reaped by us.
            Ok(_child) => true,
            Err(e) => {
                error!(script = %path.display(), "Failure running script: {:#}", e);
                false
            }
        };
    }

    let result = match Cmd::new(path).allow_fail().run() {
        Ok(result) => result,
        Err(e) => {
            error!(script = %path.display(), "Failure running script: {:#}", e);
            return false;
        }
    };

    if result.success() {
        if !result.stderr_trimmed().is_empty() {
            info!(
                script = %path.display(),
                "Output on stderr but ran successfully: {}",
                result.stderr_trimmed()
            );
        }
        true
    } else {
        error!(
            script = %path.display(),
            exit_code = result.code(),
            "Failure running script: {}",
            result.stderr_trimmed()
        );
        false
    }
}

/// What one queue drain did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Ran { script: PathBuf, success: bool },
    Empty,
}

/// Directory of scripts waiting to run in the user session.
#[derive(Debug, Clone)]
pub struct UserScriptQueue {
    dir: PathBuf,
}

impl UserScriptQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queued scripts, in file name order.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut scripts = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry
                .with_context(|| format!("Failed to list {}", self.dir.display()))?;
            if entry.file_type().is_file() {
                scripts.push(entry.into_path());
            }
        }
        Ok(scripts)
    }

    /// Run the first queued script, then delete it whatever happened.
    pub fn drain_one(&self, runner: &dyn ScriptExecutor) -> Result<QueueOutcome> {
        let Some(script) = self.pending()?.into_iter().next() else {
            warn!(queue = %self.dir.display(), "No user scripts found!");
            return Ok(QueueOutcome::Empty);
        };

        let success = runner.run(&script, true);
        if let Err(e) = fs::remove_file(&script) {
            warn!(script = %script.display(), error = %e, "failed to remove user script");
        }
        Ok(QueueOutcome::Ran { script, success })
    }
}
