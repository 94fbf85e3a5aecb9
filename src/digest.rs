//! Content digests for downloaded payloads.
//!
//! SHA-256 over the raw file bytes, lowercase hex. Comparison against the
//! manifest's declared hash is case-insensitive.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Outcome of checking a file against its expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// File exists and its digest equals the expected one.
    Match,
    /// File exists but hashes to something else.
    Mismatch { actual: String },
    /// No regular file at the path.
    Missing,
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    /// What to print as the "received" digest in logs.
    pub fn received(&self) -> &str {
        match self {
            Self::Match => "match",
            Self::Mismatch { actual } => actual,
            Self::Missing => "NOT A FILE",
        }
    }
}

/// Compute the SHA-256 of a file in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for checksum", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory buffer.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Check `path` against `expected`.
///
/// An unreadable file counts as missing: the caller re-downloads either way.
pub fn verify(path: &Path, expected: &str) -> Verification {
    if !path.is_file() {
        return Verification::Missing;
    }
    match sha256_file(path) {
        Ok(actual) if actual.eq_ignore_ascii_case(expected.trim()) => Verification::Match,
        Ok(actual) => Verification::Mismatch { actual },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to hash file");
            Verification::Missing
        }
    }
}
