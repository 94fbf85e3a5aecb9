//! Who is at the console.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;

use crate::process::Cmd;
use crate::rendezvous::Poller;

/// Console user placeholder shown while the login window is up.
const LOGIN_WINDOW: &str = "loginwindow";
/// Console user placeholder used by Setup Assistant.
const SETUP_USER: &str = "_mbsetupuser";

/// Current console user, as read from the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleUserState {
    None,
    LoginScreen,
    SetupAssistant,
    RealUser { name: String, uid: Option<u32> },
}

impl ConsoleUserState {
    /// Classify a console user name as reported by the OS.
    pub fn from_name(name: &str, uid: Option<u32>) -> Self {
        match name.trim() {
            "" => Self::None,
            // The console belongs to root while the login window is showing.
            LOGIN_WINDOW | "root" => Self::LoginScreen,
            SETUP_USER => Self::SetupAssistant,
            user => Self::RealUser {
                name: user.to_string(),
                uid,
            },
        }
    }

    pub fn is_real_user(&self) -> bool {
        matches!(self, Self::RealUser { .. })
    }

    pub fn uid(&self) -> Option<u32> {
        match self {
            Self::RealUser { uid, .. } => *uid,
            _ => None,
        }
    }
}

impl fmt::Display for ConsoleUserState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::LoginScreen => f.write_str(LOGIN_WINDOW),
            Self::SetupAssistant => f.write_str(SETUP_USER),
            Self::RealUser { name, .. } => f.write_str(name),
        }
    }
}

/// Source of the console user state.
pub trait ConsoleSession {
    fn current(&self) -> ConsoleUserState;
}

/// Reads the owner of `/dev/console`.
#[derive(Debug, Clone)]
pub struct SystemConsole {
    device: PathBuf,
}

impl Default for SystemConsole {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/console"),
        }
    }
}

impl SystemConsole {
    fn stat(&self, format: &str) -> Option<String> {
        let result = Cmd::new("stat")
            .args(["-f", format])
            .arg_path(&self.device)
            .allow_fail()
            .run()
            .ok()?;
        result
            .success()
            .then(|| result.stdout_trimmed().to_string())
    }
}

impl ConsoleSession for SystemConsole {
    fn current(&self) -> ConsoleUserState {
        let Some(name) = self.stat("%Su") else {
            return ConsoleUserState::None;
        };
        let uid = self.stat("%u").and_then(|uid| uid.parse().ok());
        ConsoleUserState::from_name(&name, uid)
    }
}

/// Block until a real user owns the console, returning that user.
pub fn await_real_user(
    console: &dyn ConsoleSession,
    poller: &Poller,
    reason: &str,
) -> ConsoleUserState {
    let state = RefCell::new(ConsoleUserState::None);
    poller.until(
        || {
            let current = console.current();
            let ready = current.is_real_user();
            *state.borrow_mut() = current;
            ready
        },
        || {
            tracing::info!(
                console_user = %state.borrow(),
                "No user session yet, delaying {} until user session",
                reason
            )
        },
    );
    state.into_inner()
}
