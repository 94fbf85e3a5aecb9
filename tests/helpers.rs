//! Shared test utilities: a temporary run environment and in-process fakes
//! for every collaborator the scheduler talks to.

#![allow(dead_code)]

use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use bootstrapper::console::{ConsoleSession, ConsoleUserState};
use bootstrapper::digest::sha256_bytes;
use bootstrapper::fetch::{FetchOutcome, FetchRequest, Fetcher};
use bootstrapper::installer::PackageInstaller;
use bootstrapper::rendezvous::{MemoryFlag, Rendezvous};
use bootstrapper::script::{ScriptExecutor, UserScriptQueue};
use bootstrapper::teardown::ServiceManager;
use bootstrapper::version::DottedVersion;
use bootstrapper::{Collaborators, RunConfig};

pub const MANIFEST_URL: &str = "https://bootstrap.test/bootstrap.json";

/// Temporary directories standing in for the device's filesystem.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub root: PathBuf,
    pub config: RunConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().to_path_buf();

        let mut config = RunConfig::with_dirs(root.join("work"), root.join("flags"));
        config.manifest_url = Some(MANIFEST_URL.to_string());
        config.daemon_id = "com.test.bootstrap".into();
        config.agent_id = "com.test.bootstrap.agent".into();
        config.status_log = root.join("status.log");
        config.launch_daemons_dir = root.join("LaunchDaemons");
        config.launch_agents_dir = root.join("LaunchAgents");
        config.flag_poll = Duration::ZERO;
        config.console_poll = Duration::ZERO;
        config.settle = Duration::ZERO;

        for dir in [&config.launch_daemons_dir, &config.launch_agents_dir] {
            fs::create_dir_all(dir).expect("Failed to create launchd dir");
        }
        fs::write(config.daemon_plist(), "<plist/>").expect("Failed to write daemon plist");
        fs::write(config.agent_plist(), "<plist/>").expect("Failed to write agent plist");

        Self {
            _temp_dir: temp_dir,
            root,
            config,
        }
    }

    /// Path under the working directory.
    pub fn work(&self, rel: &str) -> PathBuf {
        self.config.work_dir.join(rel)
    }

    /// Path under the user-script queue.
    pub fn queued(&self, name: &str) -> PathBuf {
        self.config.userscript_dir().join(name)
    }

    /// Lines written to the status log so far.
    pub fn status_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.config.status_log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// A package item entry for a manifest.
pub fn package(name: &str, file: &Path, url: &str, body: &[u8], id: &str, version: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "package",
        "name": name,
        "file": file,
        "url": url,
        "hash": sha256_bytes(body),
        "packageid": id,
        "version": version,
    })
}

pub fn rootscript(name: &str, file: &Path, url: &str, body: &[u8], wait: bool) -> serde_json::Value {
    serde_json::json!({
        "type": "rootscript",
        "name": name,
        "file": file,
        "url": url,
        "hash": sha256_bytes(body),
        "waitForCompletion": wait,
    })
}

pub fn userscript(name: &str, file: &Path, url: &str, body: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "type": "userscript",
        "name": name,
        "file": file,
        "url": url,
        "hash": sha256_bytes(body),
    })
}

/// Serves fixed payloads by URL and counts requests.
#[derive(Default)]
pub struct FakeFetcher {
    payloads: HashMap<String, Vec<u8>>,
    pub requests: RefCell<Vec<FetchRequest>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.payloads.insert(url.to_string(), body.into());
        self
    }

    /// Serve `manifest` as the bootstrap manifest.
    pub fn with_manifest(self, manifest: &serde_json::Value) -> Self {
        self.serve(MANIFEST_URL, manifest.to_string())
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        self.requests.borrow_mut().push(request.clone());
        let Some(body) = self.payloads.get(&request.url) else {
            return FetchOutcome::TransportError(format!("404 {}", request.url));
        };
        if let Some(parent) = request.dest.parent() {
            fs::create_dir_all(parent).expect("Failed to create fetch destination");
        }
        fs::write(&request.dest, body).expect("Failed to write fetched file");
        FetchOutcome::Complete(request.dest.clone())
    }
}

/// Receipt database in memory; records every install.
#[derive(Default)]
pub struct FakeInstaller {
    receipts: HashMap<String, String>,
    exit_code: i32,
    pub installed: RefCell<Vec<PathBuf>>,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_receipt(mut self, id: &str, version: &str) -> Self {
        self.receipts.insert(id.to_string(), version.to_string());
        self
    }

    pub fn failing(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }
}

impl PackageInstaller for FakeInstaller {
    fn installed_version(&self, package_id: &str) -> String {
        self.receipts
            .get(package_id)
            .cloned()
            .unwrap_or_else(|| DottedVersion::NOT_INSTALLED.to_string())
    }

    fn install(&self, path: &Path) -> Result<i32> {
        self.installed.borrow_mut().push(path.to_path_buf());
        Ok(self.exit_code)
    }
}

/// Records script runs instead of executing them.
pub struct FakeScripts {
    succeed: bool,
    pub runs: RefCell<Vec<(PathBuf, bool)>>,
}

impl FakeScripts {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            runs: RefCell::new(Vec::new()),
        }
    }

    pub fn ran(&self) -> Vec<PathBuf> {
        self.runs.borrow().iter().map(|(p, _)| p.clone()).collect()
    }
}

impl Default for FakeScripts {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ScriptExecutor for FakeScripts {
    fn run(&self, path: &Path, wait: bool) -> bool {
        self.runs.borrow_mut().push((path.to_path_buf(), wait));
        !wait || self.succeed
    }
}

/// Plays the user-session agent inline: every signal drains the whole queue
/// and clears the flag before returning.
pub struct InlineAgent {
    queue: UserScriptQueue,
    flag: MemoryFlag,
    pub signals: Cell<usize>,
    /// Contents of every script the agent consumed, in order.
    pub consumed: RefCell<Vec<String>>,
}

impl InlineAgent {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            queue: UserScriptQueue::new(config.userscript_dir()),
            flag: MemoryFlag::new(),
            signals: Cell::new(0),
            consumed: RefCell::new(Vec::new()),
        }
    }
}

impl Rendezvous for InlineAgent {
    fn signal(&self) -> Result<()> {
        self.flag.signal()?;
        self.signals.set(self.signals.get() + 1);
        for script in self.queue.pending()? {
            self.consumed
                .borrow_mut()
                .push(fs::read_to_string(&script).unwrap_or_default());
            fs::remove_file(&script)?;
        }
        self.flag.clear()
    }

    fn is_clear(&self) -> bool {
        self.flag.is_clear()
    }

    fn clear(&self) -> Result<()> {
        self.flag.clear()
    }
}

/// Console that walks through a fixed sequence of states, then stays on
/// the last one.
pub struct FakeConsole {
    states: RefCell<Vec<ConsoleUserState>>,
    pub queries: Cell<usize>,
}

impl FakeConsole {
    pub fn user() -> Self {
        Self::sequence(vec![real_user()])
    }

    pub fn sequence(mut states: Vec<ConsoleUserState>) -> Self {
        states.reverse();
        Self {
            states: RefCell::new(states),
            queries: Cell::new(0),
        }
    }
}

impl ConsoleSession for FakeConsole {
    fn current(&self) -> ConsoleUserState {
        self.queries.set(self.queries.get() + 1);
        let mut states = self.states.borrow_mut();
        if states.len() > 1 {
            states.pop().unwrap_or(ConsoleUserState::None)
        } else {
            states.last().cloned().unwrap_or(ConsoleUserState::None)
        }
    }
}

pub fn real_user() -> ConsoleUserState {
    ConsoleUserState::RealUser {
        name: "alice".into(),
        uid: Some(501),
    }
}

/// Records launchctl / shutdown calls.
#[derive(Default)]
pub struct FakeServices(pub RefCell<Vec<String>>);

impl ServiceManager for FakeServices {
    fn remove_agent(&self, uid: u32, agent_id: &str) -> Result<()> {
        self.0.borrow_mut().push(format!("remove agent {} {}", uid, agent_id));
        Ok(())
    }

    fn remove_daemon(&self, daemon_id: &str) -> Result<()> {
        self.0.borrow_mut().push(format!("remove daemon {}", daemon_id));
        Ok(())
    }

    fn reboot(&self) -> Result<()> {
        self.0.borrow_mut().push("reboot".into());
        Ok(())
    }
}

/// One of every fake, wired together.
pub struct Fakes {
    pub fetcher: FakeFetcher,
    pub installer: FakeInstaller,
    pub scripts: FakeScripts,
    pub agent: InlineAgent,
    pub console: FakeConsole,
    pub services: FakeServices,
}

impl Fakes {
    pub fn new(env: &TestEnv, fetcher: FakeFetcher) -> Self {
        Self {
            fetcher,
            installer: FakeInstaller::new(),
            scripts: FakeScripts::default(),
            agent: InlineAgent::new(&env.config),
            console: FakeConsole::user(),
            services: FakeServices::default(),
        }
    }

    pub fn deps(&self) -> Collaborators<'_> {
        Collaborators {
            fetcher: &self.fetcher,
            installer: &self.installer,
            scripts: &self.scripts,
            rendezvous: &self.agent,
            console: &self.console,
            services: &self.services,
        }
    }
}
