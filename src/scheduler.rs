//! Stage scheduler.
//!
//! Loads the manifest once, walks the stages in order and every item within
//! a stage in manifest order, one at a time. Item failures are recorded and
//! the walk continues; only fatal errors (integrity, unreadable manifest,
//! setup) stop the run. Teardown always follows a completed walk.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::console::{await_real_user, ConsoleSession};
use crate::download::Downloader;
use crate::error::{BootstrapError, BootstrapResult};
use crate::fetch::Fetcher;
use crate::installer::PackageInstaller;
use crate::manifest::{Entry, InvalidReason, Item, ItemKind, Manifest, Stage};
use crate::preflight::check_manifest_url;
use crate::rendezvous::{hand_off, Poller, Rendezvous};
use crate::script::{QueueOutcome, ScriptExecutor, UserScriptQueue};
use crate::status::StatusLog;
use crate::teardown::{teardown, ServiceManager, TeardownReport};
use crate::timing::Timer;
use crate::version::is_satisfied;

const MANIFEST_LABEL: &str = "Bootstrap.json";
const LAUNCHER_SCRIPT: &str = "notifierlauncher.sh";
const MUNKI_LOG: &str = "/Library/Managed Installs/Logs/ManagedSoftwareUpdate.log";

/// The outside world, as seen by the scheduler.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub fetcher: &'a dyn Fetcher,
    pub installer: &'a dyn PackageInstaller,
    pub scripts: &'a dyn ScriptExecutor,
    pub rendezvous: &'a dyn Rendezvous,
    pub console: &'a dyn ConsoleSession,
    pub services: &'a dyn ServiceManager,
}

/// Why an item was not acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Invalid(InvalidReason),
    AlreadyInstalled { installed: String },
    /// A user-session item found in the pre-session stage.
    SessionRequired,
}

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Skipped(SkipReason),
    Failed(String),
}

/// Tally of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub teardown: TeardownReport,
}

impl RunReport {
    fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Scheduler<'a> {
    config: &'a RunConfig,
    deps: Collaborators<'a>,
    downloader: Downloader<'a>,
    status: StatusLog,
    flag_poller: Poller,
    console_poller: Poller,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a RunConfig, deps: Collaborators<'a>) -> Self {
        let downloader = Downloader::new(deps.fetcher, config.authorization.as_deref())
            .with_settle(config.settle);
        Self {
            config,
            deps,
            downloader,
            status: StatusLog::new(&config.status_log, &config.notify),
            flag_poller: Poller::new(config.flag_poll),
            console_poller: Poller::new(config.console_poll),
        }
    }

    /// Run every stage, then tear down.
    pub fn run(&self) -> BootstrapResult<RunReport> {
        info!("Beginning bootstrap run");
        self.prepare_dirs()?;
        self.status.send_all(&self.config.notify.startup);

        let manifest = self.load_manifest()?;
        if manifest.is_empty() {
            warn!("Manifest lists no items");
        }
        // Two status steps (download + install) per user-session item.
        self.status.determinate(manifest.len(Stage::SessionBound) * 2);

        let mut report = RunReport::default();
        for stage in Stage::ALL {
            let timer = Timer::start(stage.key());
            info!("Beginning {}", stage);
            if stage == Stage::SessionBound {
                self.launch_companion();
            }
            for entry in manifest.entries(stage) {
                let outcome = self.process_entry(stage, entry)?;
                report.record(&outcome);
            }
            timer.finish();
        }

        let uid = self.deps.console.current().uid();
        report.teardown = teardown(self.config, self.deps.services, uid, &self.status);

        info!(
            completed = report.completed,
            skipped = report.skipped,
            failed = report.failed,
            teardown_failures = report.teardown.failed.len(),
            "Bootstrap run complete"
        );
        Ok(report)
    }

    fn prepare_dirs(&self) -> BootstrapResult<()> {
        let setup = |path: &Path, mode: Option<u32>| -> BootstrapResult<()> {
            let wrap = |source: std::io::Error| BootstrapError::Setup {
                path: path.to_path_buf(),
                source,
            };
            fs::create_dir_all(path).map_err(wrap)?;
            if let Some(mode) = mode {
                fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(wrap)?;
            }
            Ok(())
        };
        setup(&self.config.work_dir, None)?;
        // The console user's agent consumes the queue and clears the flag.
        setup(&self.config.userscript_dir(), Some(0o777))?;
        setup(&self.config.flag_dir, Some(0o777))?;
        Ok(())
    }

    /// Fetch the manifest unless a cached copy exists, then parse it.
    pub fn load_manifest(&self) -> BootstrapResult<Manifest> {
        let path = self.config.manifest_path();
        if path.is_file() {
            info!(manifest = %path.display(), "Using cached manifest");
        } else {
            let url = check_manifest_url(self.config)?;
            self.downloader.fetch_until_present(MANIFEST_LABEL, url, &path);
        }
        Manifest::load(&path)
    }

    /// Process one manifest slot.
    pub fn process_entry(&self, stage: Stage, entry: &Entry) -> BootstrapResult<ItemOutcome> {
        let item = match entry {
            Ok(item) => item,
            Err(invalid) => {
                warn!(
                    stage = %stage,
                    index = invalid.index,
                    item = %invalid.raw,
                    "Invalid item: {}",
                    invalid.reason
                );
                return Ok(ItemOutcome::Skipped(SkipReason::Invalid(
                    invalid.reason.clone(),
                )));
            }
        };

        info!(
            stage = %stage,
            kind = item.kind.label(),
            item = %item.name,
            path = %item.file.display(),
            "processing item"
        );

        let outcome = match item.kind {
            ItemKind::Package {
                ref package_id,
                ref version,
            } => self.package(stage, item, package_id, version)?,
            ItemKind::RootScript {
                wait_for_completion,
            } => self.root_script(stage, item, wait_for_completion)?,
            ItemKind::UserScript => self.user_script(stage, item)?,
        };

        match outcome {
            ItemOutcome::Failed(ref reason) => {
                error!(stage = %stage, item = %item.name, "item failed: {}", reason)
            }
            ItemOutcome::Skipped(ref reason) => {
                info!(stage = %stage, item = %item.name, ?reason, "item skipped")
            }
            ItemOutcome::Completed => {}
        }
        Ok(outcome)
    }

    fn download(&self, stage: Stage, item: &Item) -> BootstrapResult<u32> {
        self.downloader.ensure_with(item, || {
            if stage == Stage::SessionBound {
                self.status.status(&format!("Downloading {}", item.name));
            }
        })
    }

    fn announce_install(&self, item: &Item) {
        self.status.status(&format!("Installing: {}", item.name));
    }

    fn package(
        &self,
        stage: Stage,
        item: &Item,
        package_id: &str,
        version: &str,
    ) -> BootstrapResult<ItemOutcome> {
        let installed = self.deps.installer.installed_version(package_id);
        if is_satisfied(&installed, version) {
            info!(item = %item.name, installed = %installed, wanted = version, "Skipping - already installed");
            return Ok(ItemOutcome::Skipped(SkipReason::AlreadyInstalled {
                installed,
            }));
        }

        self.download(stage, item)?;

        if stage == Stage::SessionBound {
            await_real_user(self.deps.console, &self.console_poller, "install");
        }

        info!(item = %item.name, path = %item.file.display(), "Installing package");
        self.announce_install(item);
        Ok(match self.deps.installer.install(&item.file) {
            Ok(0) => ItemOutcome::Completed,
            Ok(code) => ItemOutcome::Failed(format!("installer exited with code {}", code)),
            Err(e) => ItemOutcome::Failed(format!("{:#}", e)),
        })
    }

    fn root_script(
        &self,
        stage: Stage,
        item: &Item,
        wait_for_completion: bool,
    ) -> BootstrapResult<ItemOutcome> {
        self.download(stage, item)?;

        info!(item = %item.name, path = %item.file.display(), wait_for_completion, "Starting root script");
        self.announce_install(item);
        let ok = self.deps.scripts.run(&item.file, wait_for_completion);
        Ok(if ok {
            ItemOutcome::Completed
        } else {
            ItemOutcome::Failed("root script failed".to_string())
        })
    }

    fn user_script(&self, stage: Stage, item: &Item) -> BootstrapResult<ItemOutcome> {
        if stage == Stage::PreSession {
            warn!(
                item = %item.name,
                path = %item.file.display(),
                "User scripts cannot run before a user session exists, removing"
            );
            match fs::remove_file(&item.file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %item.file.display(), error = %e, "failed to remove user script"),
            }
            return Ok(ItemOutcome::Skipped(SkipReason::SessionRequired));
        }

        self.download(stage, item)?;

        let queue = self.config.userscript_dir();
        if item.file.parent() != Some(queue.as_path()) {
            warn!(
                item = %item.name,
                path = %item.file.display(),
                queue = %queue.display(),
                "user script is outside the queue directory; the agent will not find it"
            );
        }

        self.announce_install(item);
        if self.config.dry_run {
            info!(item = %item.name, path = %item.file.display(), "Dry run triggering user script");
            return Ok(ItemOutcome::Completed);
        }

        info!(item = %item.name, path = %item.file.display(), "Triggering agent for user script");
        Ok(
            match hand_off(self.deps.rendezvous, &self.flag_poller, &item.name) {
                Ok(_) => ItemOutcome::Completed,
                Err(e) => ItemOutcome::Failed(format!("{:#}", e)),
            },
        )
    }

    /// Start the notification UI in the user session, if configured.
    fn launch_companion(&self) {
        let Some(ref app) = self.config.notify.app_path else {
            return;
        };
        if self.config.dry_run {
            info!(app = %app, "Dry run launching notifier");
            return;
        }

        await_real_user(self.deps.console, &self.console_poller, "notifier launch");

        let args = self.config.notify.app_args.as_deref();
        if args.is_some_and(|a| a.split_whitespace().any(|a| a == "-munki")) {
            ensure_munki_log(Path::new(MUNKI_LOG));
        }

        info!("Creating notifier launcher");
        let launcher = self.config.userscript_dir().join(LAUNCHER_SCRIPT);
        let written = fs::write(&launcher, launcher_script(app, args))
            .and_then(|()| fs::set_permissions(&launcher, fs::Permissions::from_mode(0o777)));
        if let Err(e) = written {
            warn!(path = %launcher.display(), error = %e, "failed to write notifier launcher");
            return;
        }

        if let Err(e) = hand_off(self.deps.rendezvous, &self.flag_poller, "notifier launcher") {
            warn!("failed to hand off notifier launcher: {:#}", e);
        }
    }
}

/// Agent side of the rendezvous: run one queued user script.
///
/// Clears the flag once the queue is empty. Returns whether a script ran and
/// succeeded.
pub fn run_userscript_mode(
    config: &RunConfig,
    runner: &dyn ScriptExecutor,
    flag: &dyn Rendezvous,
) -> anyhow::Result<bool> {
    let queue = UserScriptQueue::new(config.userscript_dir());
    let outcome = queue.drain_one(runner)?;

    if queue.pending()?.is_empty() {
        info!(
            queue = %queue.dir().display(),
            flag = %config.flag_path().display(),
            "User script queue empty, clearing flag"
        );
        flag.clear()?;
    }

    Ok(match outcome {
        QueueOutcome::Ran { script, success } => {
            info!(script = %script.display(), success, "User script finished");
            success
        }
        QueueOutcome::Empty => false,
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell script that opens the notifier app with its arguments.
pub fn launcher_script(app: &str, args: Option<&str>) -> String {
    let mut line = format!("/usr/bin/open {}", shell_quote(app));
    if let Some(args) = args {
        line.push_str(" --args");
        for arg in args.split_whitespace() {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
    }
    format!("#!/bin/sh\n{}\n", line)
}

/// The notifier tails this log in `-munki` mode; it has to exist.
fn ensure_munki_log(path: &Path) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o755))?;
        }
        if !path.is_file() {
            fs::OpenOptions::new().create(true).append(true).open(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to create Munki log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_script_without_args() {
        assert_eq!(
            launcher_script("/Applications/Utilities/DEPNotify.app", None),
            "#!/bin/sh\n/usr/bin/open '/Applications/Utilities/DEPNotify.app'\n"
        );
    }

    #[test]
    fn test_launcher_script_with_args() {
        assert_eq!(
            launcher_script("/Applications/My App.app", Some("-munki  -fullScreen")),
            "#!/bin/sh\n/usr/bin/open '/Applications/My App.app' --args '-munki' '-fullScreen'\n"
        );
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_ensure_munki_log_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("Managed Installs/Logs/ManagedSoftwareUpdate.log");
        ensure_munki_log(&log);
        assert!(log.is_file());
        // Existing log left alone.
        fs::write(&log, "keep").unwrap();
        ensure_munki_log(&log);
        assert_eq!(fs::read_to_string(&log).unwrap(), "keep");
    }

    #[test]
    fn test_report_tally() {
        let mut report = RunReport::default();
        report.record(&ItemOutcome::Completed);
        report.record(&ItemOutcome::Skipped(SkipReason::SessionRequired));
        report.record(&ItemOutcome::Failed("x".into()));
        report.record(&ItemOutcome::Completed);
        assert_eq!((report.completed, report.skipped, report.failed), (2, 1, 1));
    }
}
