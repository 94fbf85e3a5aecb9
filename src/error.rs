//! Fatal error taxonomy.
//!
//! Anything in here stops the run: the binary exits with status 1.
//! Per-item problems are not errors; see [`crate::scheduler::ItemOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Conditions that make all further progress meaningless.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no manifest URL specified")]
    MissingManifestUrl,

    #[error("bootstrapper requires root (running as uid {uid})")]
    NotPrivileged { uid: String },

    #[error(
        "hash retry failed for {name} after {attempts} downloads: \
         expected {expected}, received {received}"
    )]
    IntegrityExhausted {
        name: String,
        path: PathBuf,
        expected: String,
        received: String,
        attempts: u32,
    },

    #[error("failed to read manifest {}", path.display())]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest {} is not valid JSON", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest {} must be an object mapping stage names to item lists", path.display())]
    ManifestShape { path: PathBuf },

    #[error("failed to prepare {}", path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for fatal errors.
pub type BootstrapResult<T> = Result<T, BootstrapError>;
