//! Download-and-verify coordination.
//!
//! An item's file is only handed to the installer or script runner once it
//! hashes to the manifest's digest. A payload that still mismatches after
//! one fetch plus [`HASH_RETRIES`] retries is fatal for the whole run:
//! continuing would install unverified content.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::digest;
use crate::error::{BootstrapError, BootstrapResult};
use crate::fetch::{FetchOutcome, FetchRequest, Fetcher};
use crate::manifest::{Item, ItemKind};

/// Extra fetches allowed after the first one mismatches.
pub const HASH_RETRIES: u32 = 3;

/// Pause after each fetch before looking at the file.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Drives a [`Fetcher`] until files are present and verified.
pub struct Downloader<'a> {
    fetcher: &'a dyn Fetcher,
    authorization: Option<String>,
    settle: Duration,
    retries: u32,
}

impl<'a> Downloader<'a> {
    pub fn new(fetcher: &'a dyn Fetcher, authorization: Option<&str>) -> Self {
        Self {
            fetcher,
            authorization: authorization.map(str::to_string),
            settle: DEFAULT_SETTLE,
            retries: HASH_RETRIES,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn fetch_once(&self, name: &str, url: &str, dest: &Path) {
        let request =
            FetchRequest::new(name, url, dest).with_authorization(self.authorization.as_deref());
        match self.fetcher.fetch(&request) {
            FetchOutcome::Complete(path) => debug!(item = name, path = %path.display(), "fetched"),
            FetchOutcome::Partial { path, bytes } => {
                warn!(item = name, path = %path.display(), bytes, "fetch returned partial data")
            }
            FetchOutcome::TransportError(e) => warn!(item = name, url, "fetch failed: {}", e),
        }
        std::thread::sleep(self.settle);
    }

    /// Make sure `item.file` exists and matches its declared hash.
    ///
    /// Items without a source are assumed staged and left alone. Returns
    /// the number of fetches performed.
    pub fn ensure(&self, item: &Item) -> BootstrapResult<u32> {
        self.ensure_with(item, || {})
    }

    /// Like [`Downloader::ensure`], calling `before_fetch` ahead of every fetch.
    pub fn ensure_with(&self, item: &Item, mut before_fetch: impl FnMut()) -> BootstrapResult<u32> {
        let Some(ref source) = item.source else {
            return Ok(0);
        };

        let mut fetches = 0;
        let mut state = digest::verify(&item.file, &source.hash);

        while !state.is_match() {
            if fetches > self.retries {
                return Err(BootstrapError::IntegrityExhausted {
                    name: item.name.clone(),
                    path: item.file.clone(),
                    expected: source.hash.clone(),
                    received: state.received().to_string(),
                    attempts: fetches,
                });
            }
            if fetches > 0 {
                warn!(
                    item = %item.name,
                    received = state.received(),
                    expected = %source.hash,
                    "Hash failed"
                );
            }
            before_fetch();
            self.fetch_once(&item.name, &source.url, &item.file);
            fetches += 1;
            state = digest::verify(&item.file, &source.hash);
        }

        if fetches > 0 {
            info!(item = %item.name, expected = %source.hash, fetches, "Hash validated");
        } else {
            debug!(item = %item.name, "already staged and verified");
        }
        normalize_permissions(item);
        Ok(fetches)
    }

    /// Fetch `url` to `dest` until a file exists there. No hash check, no limit.
    pub fn fetch_until_present(&self, name: &str, url: &str, dest: &Path) -> u32 {
        let mut fetches = 0;
        while !dest.is_file() {
            self.fetch_once(name, url, dest);
            fetches += 1;
        }
        fetches
    }
}

/// Mode a verified file should end up with, if any.
pub fn target_mode(kind: &ItemKind) -> Option<u32> {
    match kind {
        ItemKind::Package { .. } => None,
        ItemKind::RootScript { .. } => Some(0o755),
        // Runs as the console user, who also has to delete it.
        ItemKind::UserScript => Some(0o777),
    }
}

fn normalize_permissions(item: &Item) {
    let Some(mode) = target_mode(&item.kind) else {
        return;
    };
    if let Err(e) = fs::set_permissions(&item.file, fs::Permissions::from_mode(mode)) {
        warn!(item = %item.name, path = %item.file.display(), error = %e, "failed to set permissions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_bytes;
    use crate::manifest::Source;
    use std::cell::Cell;
    use std::path::PathBuf;

    /// Writes a fixed body to the destination on every fetch.
    struct Serve {
        body: Vec<u8>,
        calls: Cell<u32>,
    }

    impl Serve {
        fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                calls: Cell::new(0),
            }
        }
    }

    impl Fetcher for Serve {
        fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
            self.calls.set(self.calls.get() + 1);
            fs::write(&request.dest, &self.body).unwrap();
            FetchOutcome::Complete(request.dest.clone())
        }
    }

    fn item(file: PathBuf, hash: &str, kind: ItemKind) -> Item {
        Item {
            name: "A".into(),
            file,
            source: Some(Source {
                url: "https://h/a".into(),
                hash: hash.into(),
            }),
            kind,
        }
    }

    fn package() -> ItemKind {
        ItemKind::Package {
            package_id: "com.x.a".into(),
            version: "2.0".into(),
        }
    }

    #[test]
    fn test_already_matching_file_is_not_fetched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pkg");
        fs::write(&file, b"payload").unwrap();
        let fetcher = Serve::new(b"other");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);

        assert_eq!(d.ensure(&item(file, &sha256_bytes(b"payload"), package())).unwrap(), 0);
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn test_missing_file_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pkg");
        let fetcher = Serve::new(b"payload");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);

        assert_eq!(d.ensure(&item(file.clone(), &sha256_bytes(b"payload"), package())).unwrap(), 1);
        assert_eq!(fs::read(&file).unwrap(), b"payload");
    }

    #[test]
    fn test_never_matching_hash_gives_up_after_four_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pkg");
        let fetcher = Serve::new(b"tampered");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);

        let err = d
            .ensure(&item(file, &sha256_bytes(b"payload"), package()))
            .unwrap_err();

        assert_eq!(fetcher.calls.get(), 1 + HASH_RETRIES);
        match err {
            BootstrapError::IntegrityExhausted { attempts, received, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(received, sha256_bytes(b"tampered"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_stale_file_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pkg");
        fs::write(&file, b"old version").unwrap();
        let fetcher = Serve::new(b"payload");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);

        assert_eq!(d.ensure(&item(file.clone(), &sha256_bytes(b"payload"), package())).unwrap(), 1);
        assert_eq!(fs::read(&file).unwrap(), b"payload");
    }

    #[test]
    fn test_before_fetch_called_per_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Serve::new(b"payload");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);
        let mut announced = 0;

        d.ensure_with(
            &item(dir.path().join("a.pkg"), &sha256_bytes(b"payload"), package()),
            || announced += 1,
        )
        .unwrap();
        assert_eq!(announced, 1);
    }

    #[test]
    fn test_item_without_source_untouched() {
        let fetcher = Serve::new(b"x");
        let d = Downloader::new(&fetcher, None);
        let staged = Item {
            name: "S".into(),
            file: PathBuf::from("/nonexistent/staged.sh"),
            source: None,
            kind: ItemKind::RootScript {
                wait_for_completion: true,
            },
        };
        assert_eq!(d.ensure(&staged).unwrap(), 0);
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn test_script_permissions_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Serve::new(b"#!/bin/sh\n");
        let d = Downloader::new(&fetcher, None).with_settle(Duration::ZERO);
        let hash = sha256_bytes(b"#!/bin/sh\n");

        let root = dir.path().join("root.sh");
        d.ensure(&item(root.clone(), &hash, ItemKind::RootScript { wait_for_completion: true }))
            .unwrap();
        let user = dir.path().join("user.sh");
        d.ensure(&item(user.clone(), &hash, ItemKind::UserScript)).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&root), 0o755);
        assert_eq!(mode(&user), 0o777);
    }

    #[test]
    fn test_authorization_forwarded() {
        struct Check;
        impl Fetcher for Check {
            fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
                assert_eq!(request.authorization.as_deref(), Some("Basic xyz"));
                fs::write(&request.dest, b"{}").unwrap();
                FetchOutcome::Complete(request.dest.clone())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bootstrap.json");
        let d = Downloader::new(&Check, Some("Basic xyz")).with_settle(Duration::ZERO);
        assert_eq!(d.fetch_until_present("Bootstrap.json", "https://h/b.json", &dest), 1);
    }

    #[test]
    fn test_fetch_until_present_retries_transport_errors() {
        struct Flaky(Cell<u32>);
        impl Fetcher for Flaky {
            fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
                self.0.set(self.0.get() + 1);
                if self.0.get() < 3 {
                    return FetchOutcome::TransportError("connection reset".into());
                }
                fs::write(&request.dest, b"{}").unwrap();
                FetchOutcome::Complete(request.dest.clone())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bootstrap.json");
        let flaky = Flaky(Cell::new(0));
        let d = Downloader::new(&flaky, None).with_settle(Duration::ZERO);

        assert_eq!(d.fetch_until_present("Bootstrap.json", "https://h/b.json", &dest), 3);
    }
}
