//! Bootstrapper library exports.
//!
//! Every component is public so integration tests can drive the scheduler
//! with in-process collaborators.

pub mod config;
pub mod console;
pub mod digest;
pub mod download;
pub mod error;
pub mod fetch;
pub mod installer;
pub mod manifest;
pub mod preflight;
pub mod process;
pub mod rendezvous;
pub mod scheduler;
pub mod script;
pub mod status;
pub mod teardown;
pub mod timing;
pub mod version;

pub use config::RunConfig;
pub use error::{BootstrapError, BootstrapResult};
pub use scheduler::{Collaborators, ItemOutcome, RunReport, Scheduler};
