//! Linked-device session: where the client stands relative to a Signal
//! account, plus discovery of accounts already linked on this machine.

pub mod linking;
pub mod state_machine;

use serde_json::Value;
use std::fmt;
use std::path::Path;

pub use linking::{LinkingSession, LinkingStatus, LinkingStream};
pub use state_machine::{SessionMachine, TransitionError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected { reason: DisconnectReason },
    Linking(LinkingState),
    Linked { account: String },
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Disconnected {
            reason: DisconnectReason::NotLinked,
        }
    }
}

impl SessionState {
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Linked { .. })
    }

    pub fn account(&self) -> Option<&str> {
        match self {
            Self::Linked { account } => Some(account),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected { reason } => write!(f, "disconnected ({})", reason),
            Self::Linking(step) => write!(f, "linking ({:?})", step),
            Self::Linked { account } => write!(f, "linked as {}", account),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingState {
    AwaitingScan,
    Confirmed,
    Expired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No credentials; linking required
    NotLinked,
    ConnectionLost,
    Reconnecting { attempt: u32 },
    ReconnectExhausted,
    DaemonFailed(String),
    LinkExpired,
    LinkFailed(String),
    LinkCancelled,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLinked => write!(f, "not linked"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting, attempt {}", attempt),
            Self::ReconnectExhausted => write!(f, "reconnect attempts exhausted"),
            Self::DaemonFailed(why) => write!(f, "daemon failed: {}", why),
            Self::LinkExpired => write!(f, "link code expired"),
            Self::LinkFailed(why) => write!(f, "linking failed: {}", why),
            Self::LinkCancelled => write!(f, "linking cancelled"),
            Self::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Accounts signal-cli holds credentials for under `config_dir`.
///
/// Reads `data/accounts.json` (signal-cli 0.9+) and falls back to the older
/// one-file-per-number layout in `data/`.
pub fn linked_accounts(config_dir: &Path) -> Vec<String> {
    let data = config_dir.join("data");

    if let Ok(raw) = std::fs::read_to_string(data.join("accounts.json")) {
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => {
                let accounts: Vec<String> = v
                    .get("accounts")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|a| a.get("number").and_then(Value::as_str))
                    .map(String::from)
                    .collect();
                if !accounts.is_empty() {
                    return accounts;
                }
            }
            Err(e) => tracing::warn!("Unreadable {}: {}", data.join("accounts.json").display(), e),
        }
    }

    let Ok(entries) = std::fs::read_dir(&data) else {
        return Vec::new();
    };
    let mut accounts: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with('+') && name[1..].chars().all(|c| c.is_ascii_digit()))
        .collect();
    accounts.sort();
    accounts
}
