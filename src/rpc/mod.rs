//! JSON-RPC plumbing between the client facade and signal-cli.
//!
//! Two backends implement [`RpcBackend`]:
//! - [`dispatcher::Dispatcher`] talks to a long-lived daemon over a
//!   [`crate::transport::Connection`] and publishes notifications to an
//!   [`hub::EventHub`]
//! - [`crate::transport::oneshot::OneShotBackend`] runs one signal-cli process
//!   per call and has no event stream

pub mod dispatcher;
pub mod events;
pub mod hub;
pub mod message;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("'{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("signal-cli error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Connection to signal-cli lost")]
    ConnectionLost,

    #[error("Failed to launch signal-cli: {0}")]
    Spawn(String),

    #[error("Method '{0}' is not supported by this transport")]
    Unsupported(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// The remote side does not know the method at all.
    pub fn is_method_missing(&self) -> bool {
        matches!(self, Self::Unsupported(_))
            || matches!(self, Self::Remote { code, .. } if *code == METHOD_NOT_FOUND)
    }
}

/// Request/response contract shared by the daemon and one-shot transports.
#[async_trait]
pub trait RpcBackend: Send + Sync {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError>;

    /// Whether unsolicited events are delivered at all.
    fn supports_events(&self) -> bool;

    /// Resolves once the backend can no longer serve calls.
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    async fn close(&self);

    /// Account used for calls that need one (one-shot mode passes `-a`).
    fn set_account(&self, _account: &str) {}
}
