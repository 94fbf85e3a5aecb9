//! Stage timing.

use std::time::{Duration, Instant};

/// Measures one phase of the run and logs its duration when finished.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given phase name.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer and log the elapsed time.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        if secs >= 60.0 {
            tracing::info!(phase = %self.name, "finished in {:.1}m", secs / 60.0);
        } else {
            tracing::info!(phase = %self.name, "finished in {:.1}s", secs);
        }
        elapsed
    }
}
