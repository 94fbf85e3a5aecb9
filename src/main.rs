//! Bootstrapper - manifest-driven device bootstrap.
//!
//! Runs as a privileged daemon to install the items of a remote manifest,
//! or with `--userscript` as the user-session agent that drains one queued
//! user script.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bootstrapper::config::{self, RunConfig};
use bootstrapper::console::SystemConsole;
use bootstrapper::fetch::CurlFetcher;
use bootstrapper::installer::SystemInstaller;
use bootstrapper::preflight;
use bootstrapper::rendezvous::FlagFile;
use bootstrapper::scheduler::{run_userscript_mode, Collaborators, Scheduler};
use bootstrapper::script::SystemScripts;
use bootstrapper::status::{NotifyOptions, DEFAULT_STATUS_LOG};
use bootstrapper::teardown::Launchctl;

#[derive(Parser)]
#[command(name = "bootstrapper")]
#[command(about = "Install the packages and scripts of a bootstrap manifest")]
#[command(
    after_help = "MODES:\n  bootstrapper --manifest-url <URL>   Run every stage (as root)\n  bootstrapper --userscript            Run one queued user script (as the console user)"
)]
struct Cli {
    /// URL of the bootstrap manifest (required unless --userscript)
    #[arg(long, env = "BOOTSTRAP_MANIFEST_URL")]
    manifest_url: Option<String>,

    /// Working directory for the cached manifest and user-script queue
    #[arg(long, env = "BOOTSTRAP_WORK_DIR", default_value = config::DEFAULT_WORK_DIR)]
    work_dir: PathBuf,

    /// Directory holding the user-script flag
    #[arg(long, env = "BOOTSTRAP_FLAG_DIR", default_value = config::DEFAULT_FLAG_DIR)]
    flag_dir: PathBuf,

    /// LaunchDaemon identifier
    #[arg(long, env = "BOOTSTRAP_DAEMON_ID", default_value = config::DEFAULT_IDENTIFIER)]
    daemon_id: String,

    /// LaunchAgent identifier
    #[arg(long, env = "BOOTSTRAP_AGENT_ID", default_value = config::DEFAULT_IDENTIFIER)]
    agent_id: String,

    /// Value sent as the Authorization header on every download
    #[arg(long, env = "BOOTSTRAP_AUTH_HEADER")]
    auth_header: Option<String>,

    /// Reboot when finished instead of unloading the daemon
    #[arg(long, env = "BOOTSTRAP_REBOOT")]
    reboot: bool,

    /// Log what would be installed or run without doing it
    #[arg(long, env = "BOOTSTRAP_DRY_RUN")]
    dry_run: bool,

    /// Run one queued user script and exit
    #[arg(long)]
    userscript: bool,

    /// Notifier lines, e.g. "Command: WindowTitle: Setup" or "Command: Quit"
    #[arg(long, num_args = 1..)]
    notify: Vec<String>,

    /// Status log tailed by the notifier
    #[arg(long, env = "BOOTSTRAP_STATUS_LOG", default_value = DEFAULT_STATUS_LOG)]
    status_log: PathBuf,

    /// Also write logs to this file
    #[arg(long, env = "BOOTSTRAP_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            manifest_url: self.manifest_url.clone(),
            daemon_id: self.daemon_id.clone(),
            agent_id: self.agent_id.clone(),
            authorization: self.auth_header.clone(),
            reboot: self.reboot,
            dry_run: self.dry_run,
            notify: NotifyOptions::parse(&self.notify),
            status_log: self.status_log.clone(),
            ..RunConfig::with_dirs(&self.work_dir, &self.flag_dir)
        }
    }
}

/// Stderr logging, plus a plain file layer when `log_file` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(false)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init();

    guard
}

fn run(config: &RunConfig, userscript: bool) -> Result<bool> {
    if userscript {
        info!("Running in user script mode");
        let runner = SystemScripts::new(config.dry_run);
        let flag = FlagFile::new(config.flag_path());
        return run_userscript_mode(config, &runner, &flag);
    }

    preflight::run(config)?;

    let fetcher = CurlFetcher::default();
    let installer = SystemInstaller::new(config.dry_run);
    let scripts = SystemScripts::new(config.dry_run);
    let flag = FlagFile::new(config.flag_path());
    let console = SystemConsole::default();
    let services = Launchctl;

    let deps = Collaborators {
        fetcher: &fetcher,
        installer: &installer,
        scripts: &scripts,
        rendezvous: &flag,
        console: &console,
        services: &services,
    };
    Scheduler::new(config, deps).run()?;
    Ok(true)
}

fn main() -> ExitCode {
    // Load .env if present; real environment variables win.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref());

    let config = cli.run_config();
    config.log_summary();

    match run(&config, cli.userscript) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
