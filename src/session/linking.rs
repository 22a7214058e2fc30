//! Device linking: obtain a `sgnl://` URI, wait for the phone to scan it.

use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ClientError;
use crate::rpc::events::{Event, LinkOutcome, LinkingStatusChanged};
use crate::rpc::hub::{RecvError, Subscription};
use crate::rpc::{RpcBackend, RpcError};

/// One linking attempt. Starting a new one supersedes this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkingSession {
    pub id: Uuid,
    pub uri: String,
    pub started_at: Instant,
    pub expires_at: Instant,
}

impl LinkingSession {
    pub fn new(uri: String, expiry: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            id: Uuid::new_v4(),
            uri,
            started_at,
            expires_at: started_at + expiry,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Progress reported to whoever started linking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkingStatus {
    AwaitingScan { uri: String },
    Confirmed { account: String },
    Expired,
    Failed { reason: String },
    Cancelled,
}

impl LinkingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::AwaitingScan { .. })
    }
}

/// Receiving side of a linking attempt. Ends after a terminal status.
pub struct LinkingStream {
    rx: mpsc::Receiver<LinkingStatus>,
}

impl LinkingStream {
    pub(crate) fn new(rx: mpsc::Receiver<LinkingStatus>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<LinkingStatus> {
        self.rx.recv().await
    }

    /// Drain the stream and return the linked account.
    pub async fn wait_for_account(mut self) -> Result<String, ClientError> {
        while let Some(status) = self.next().await {
            match status {
                LinkingStatus::AwaitingScan { .. } => continue,
                LinkingStatus::Confirmed { account } => return Ok(account),
                LinkingStatus::Expired => return Err(ClientError::LinkExpired),
                LinkingStatus::Failed { reason } => {
                    return Err(ClientError::Remote { code: -1, message: reason })
                }
                LinkingStatus::Cancelled => return Err(ClientError::LinkSuperseded),
            }
        }
        Err(ClientError::LinkSuperseded)
    }
}

/// How a wait for confirmation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    Confirmed { account: Option<String> },
    Expired,
    Failed(String),
    Cancelled,
}

/// `startLink` and pull the URI out of the result.
pub async fn request_link_uri(backend: &dyn RpcBackend, timeout: Duration) -> Result<String, RpcError> {
    let result = backend.call("startLink", json!({}), timeout).await?;
    result
        .get("deviceLinkUri")
        .and_then(Value::as_str)
        .or_else(|| result.as_str())
        .map(String::from)
        .ok_or_else(|| RpcError::InvalidResponse(format!("startLink returned no URI: {}", result)))
}

fn account_from(result: &Value) -> Option<String> {
    ["number", "account"]
        .iter()
        .find_map(|k| result.get(*k).and_then(Value::as_str))
        .map(String::from)
}

async fn next_link_event(events: &mut Option<Subscription>) -> Option<LinkingStatusChanged> {
    let Some(sub) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match sub.recv().await {
            Ok(Event::LinkingStatusChanged(status)) => return Some(status),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed | RecvError::Overflowed) => return None,
        }
    }
}

/// Wait until the URI is scanned, the code expires, or the attempt is
/// cancelled. Confirmation comes from whichever arrives first: the
/// `finishLink` reply or a `linkingStatus` notification.
pub async fn await_confirmation(
    backend: &dyn RpcBackend,
    session: &LinkingSession,
    device_name: &str,
    mut events: Option<Subscription>,
    cancel: &CancellationToken,
) -> LinkResolution {
    let expiry = session.remaining();
    let finish = backend.call(
        "finishLink",
        json!({ "deviceLinkUri": session.uri, "deviceName": device_name }),
        expiry,
    );
    tokio::pin!(finish);
    let deadline = tokio::time::sleep(expiry);
    tokio::pin!(deadline);
    let mut finish_pending = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return LinkResolution::Cancelled,
            _ = &mut deadline => return LinkResolution::Expired,
            result = &mut finish, if finish_pending => {
                finish_pending = false;
                match result {
                    Ok(v) => return LinkResolution::Confirmed { account: account_from(&v) },
                    Err(RpcError::Timeout { .. }) => return LinkResolution::Expired,
                    Err(e) if e.is_method_missing() => {
                        tracing::debug!("finishLink unavailable, waiting for linking events");
                    }
                    Err(e) => return LinkResolution::Failed(e.to_string()),
                }
            }
            status = next_link_event(&mut events) => match status {
                Some(LinkingStatusChanged { outcome: LinkOutcome::Confirmed, account, .. }) => {
                    return LinkResolution::Confirmed { account };
                }
                Some(LinkingStatusChanged { outcome: LinkOutcome::Expired, .. }) => {
                    return LinkResolution::Expired;
                }
                Some(LinkingStatusChanged { outcome: LinkOutcome::Failed, message, .. }) => {
                    return LinkResolution::Failed(message.unwrap_or_else(|| "linking failed".into()));
                }
                None => events = None,
            },
        }
    }
}
