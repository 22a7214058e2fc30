//! Errors surfaced by [`crate::client::SignalClient`].

use std::time::Duration;

use crate::rpc::RpcError;
use crate::supervisor::SupervisorError;
use crate::transport::TransportError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not linked to a Signal account")]
    NotLinked,

    #[error("Connection to signal-cli lost")]
    ConnectionLost,

    #[error("'{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("signal-cli rejected the request ({code}): {message}")]
    Remote { code: i64, message: String },

    #[error("Failed to start signal-cli: {0}")]
    ProcessSpawn(String),

    #[error("Cannot reach signal-cli daemon: {0}")]
    Connect(String),

    #[error("signal-cli daemon keeps failing: {0}")]
    Fatal(String),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Linking attempt was cancelled or replaced by a newer one")]
    LinkSuperseded,

    #[error("Link code expired before it was scanned")]
    LinkExpired,

    #[error("Client is shut down")]
    Shutdown,
}

impl ClientError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotLinked => "NOT_LINKED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::ProcessSpawn(_) => "PROCESS_SPAWN",
            Self::Connect(_) => "CONNECT_FAILED",
            Self::Fatal(_) => "FATAL",
            Self::ReconnectExhausted(_) => "RECONNECT_EXHAUSTED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::LinkSuperseded => "LINK_SUPERSEDED",
            Self::LinkExpired => "LINK_EXPIRED",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Worth trying again once connectivity is back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost
                | Self::Timeout { .. }
                | Self::Connect(_)
                | Self::ReconnectExhausted(_)
                | Self::LinkExpired
        )
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Timeout { method, after } => Self::Timeout { method, after },
            RpcError::Remote { code, message } => Self::Remote { code, message },
            RpcError::ConnectionLost => Self::ConnectionLost,
            RpcError::Spawn(msg) => Self::ProcessSpawn(msg),
            RpcError::Unsupported(method) => {
                Self::InvalidRequest(format!("'{}' is not available in this mode", method))
            }
            RpcError::InvalidParams(msg) => Self::InvalidRequest(msg),
            RpcError::InvalidResponse(msg) => Self::Remote { code: -1, message: msg },
        }
    }
}

impl From<SupervisorError> for ClientError {
    fn from(e: SupervisorError) -> Self {
        match &e {
            SupervisorError::CrashLoop { .. } => Self::Fatal(e.to_string()),
            SupervisorError::Spawn { .. } | SupervisorError::NotReady { .. } => {
                Self::ProcessSpawn(e.to_string())
            }
            SupervisorError::NotRunning(_) => Self::Connect(e.to_string()),
            SupervisorError::Transition(_) | SupervisorError::Io(_) => Self::Connect(e.to_string()),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::ConnectionLost,
            other => Self::Connect(other.to_string()),
        }
    }
}
