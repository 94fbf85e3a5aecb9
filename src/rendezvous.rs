//! Rendezvous with the user-session agent.
//!
//! The privileged process and the agent share nothing but a flag: creating
//! it asks the agent to drain the user-script queue, and the agent deletes
//! it when done. The privileged side polls for absence at a fixed interval
//! with no timeout; if the agent never runs, neither do we.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Fixed-interval, unbounded polling.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
}

impl Poller {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until `ready` returns true, calling `on_wait` before each sleep.
    ///
    /// Returns how many times it slept.
    pub fn until(&self, mut ready: impl FnMut() -> bool, mut on_wait: impl FnMut()) -> u64 {
        let mut cycles = 0;
        while !ready() {
            on_wait();
            std::thread::sleep(self.interval);
            cycles += 1;
        }
        cycles
    }
}

/// Two-state request/clear channel.
pub trait Rendezvous {
    /// Request work from the agent.
    fn signal(&self) -> Result<()>;

    /// True once no request is outstanding.
    fn is_clear(&self) -> bool;

    /// Mark the outstanding request done (agent side).
    fn clear(&self) -> Result<()>;
}

/// Filesystem-backed flag: present means requested.
#[derive(Debug, Clone)]
pub struct FlagFile {
    path: PathBuf,
}

impl FlagFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Rendezvous for FlagFile {
    fn signal(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to create flag {}", self.path.display()))?;
        // The agent runs as the console user and must be able to delete it.
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("Failed to chmod flag {}", self.path.display()))?;
        debug!(flag = %self.path.display(), "flag set");
        Ok(())
    }

    fn is_clear(&self) -> bool {
        !self.path.exists()
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove flag {}", self.path.display()))
            }
        }
    }
}

/// In-memory flag for tests and in-process agents.
///
/// Clones share state, so one clone can play the agent.
#[derive(Debug, Clone, Default)]
pub struct MemoryFlag {
    set: Arc<AtomicBool>,
}

impl MemoryFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Rendezvous for MemoryFlag {
    fn signal(&self) -> Result<()> {
        self.set.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_clear(&self) -> bool {
        !self.set.load(Ordering::SeqCst)
    }

    fn clear(&self) -> Result<()> {
        self.set.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Block until the agent has cleared the flag.
pub fn await_clearance(flag: &dyn Rendezvous, poller: &Poller, waiting_for: &str) -> u64 {
    poller.until(
        || flag.is_clear(),
        || info!("Waiting for {} to complete", waiting_for),
    )
}

/// Request work and block until it is done.
pub fn hand_off(flag: &dyn Rendezvous, poller: &Poller, waiting_for: &str) -> Result<u64> {
    flag.signal()?;
    debug!(
        waiting_for,
        interval_ms = poller.interval().as_millis() as u64,
        "flag raised, polling for clearance"
    );
    Ok(await_clearance(flag, poller, waiting_for))
}
