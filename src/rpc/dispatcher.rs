//! Request/response correlation over one daemon connection.
//!
//! Callers write a request and park on a oneshot keyed by the request id.
//! A single receive task reads frames, completes the matching pending call or
//! turns notifications into [`Event`]s. When the connection drops every
//! pending call fails with [`RpcError::ConnectionLost`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{parse_notification, Event, EventFilter};
use super::hub::{EventHub, Subscription};
use super::message::{classify, Incoming, Request};
use super::{RpcBackend, RpcError};
use crate::transport::{Connection, FrameReader, FrameWriter, Inbound};

struct PendingCall {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingCall>,
    closed: bool,
}

struct Shared {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<FrameWriter>,
    hub: EventHub,
    /// Cancelled once the connection is gone
    closed: CancellationToken,
    /// Asks the receive loop to stop
    shutdown: CancellationToken,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, id: u64, outcome: Result<Value, RpcError>) {
        let call = self.pending().entries.remove(&id);
        match call {
            Some(call) => {
                tracing::debug!(
                    "'{}' (id {}) answered in {:?}",
                    call.method,
                    id,
                    call.created_at.elapsed()
                );
                // the caller may have given up already
                let _ = call.tx.send(outcome);
            }
            None => tracing::warn!("Discarding response for unknown or expired id {}", id),
        }
    }

    fn route(&self, frame: Value) {
        match classify(frame) {
            Incoming::Response { id: Some(id), outcome } => self.complete(id, outcome),
            Incoming::Response { id: None, .. } => {
                tracing::warn!("Discarding response with unrecognised id");
            }
            Incoming::Notification(frame) => match parse_notification(&frame) {
                Some(event) => {
                    self.hub.publish(event);
                }
                None => tracing::debug!("Ignoring notification: {}", frame),
            },
        }
    }

    fn fail_all(&self) {
        let drained: Vec<(u64, PendingCall)> = {
            let mut table = self.pending();
            table.closed = true;
            table.entries.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!("Failing {} pending call(s): connection lost", drained.len());
        }
        for (_, call) in drained {
            let _ = call.tx.send(Err(RpcError::ConnectionLost));
        }
    }
}

/// Removes the pending entry when the call future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().entries.remove(&self.id);
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Take ownership of a connection and start the receive loop.
    pub fn new(connection: Connection, hub: EventHub) -> Self {
        let (reader, writer) = connection.into_split();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(writer),
            hub,
            closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(receive_loop(shared.clone(), reader));
        Self {
            shared,
            receive_task: Mutex::new(Some(task)),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.shared.hub.subscribe(filter)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().entries.len()
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.pending();
            if table.closed {
                return Err(RpcError::ConnectionLost);
            }
            table.entries.insert(
                id,
                PendingCall {
                    method: request.method.clone(),
                    created_at: request.created_at,
                    tx,
                },
            );
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.send(&request.to_frame()).await {
                tracing::warn!("Failed to write '{}' request: {}", method, e);
                return Err(RpcError::ConnectionLost);
            }
        }

        rx.await.unwrap_or(Err(RpcError::ConnectionLost))
    }
}

#[async_trait]
impl RpcBackend for Dispatcher {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        match tokio::time::timeout(timeout, self.request(method, params)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("'{}' timed out after {:?}", method, timeout);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    fn supports_events(&self) -> bool {
        true
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    async fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.writer.lock().await.shutdown().await;
        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn receive_loop(shared: Arc<Shared>, mut reader: FrameReader) {
    loop {
        let item = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                tracing::debug!("Receive loop stopped");
                break;
            }
            item = reader.next() => item,
        };

        match item {
            Ok(Inbound::Frame(frame)) => shared.route(frame),
            Ok(Inbound::Malformed(e)) => {
                tracing::warn!("Discarding malformed frame: {}", e);
                shared.hub.publish(Event::ProtocolError {
                    detail: e.to_string(),
                });
            }
            Err(e) => {
                tracing::info!("Daemon connection ended: {}", e);
                break;
            }
        }
    }

    shared.fail_all();
    shared.closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::events::EventKind;
    use crate::rpc::hub::RecvError;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const T: Duration = Duration::from_secs(5);

    fn pair() -> (Dispatcher, EventHub, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let hub = EventHub::new(16, 64);
        let dispatcher = Dispatcher::new(Connection::from_stream(client), hub.clone());
        (dispatcher, hub, server)
    }

    async fn read_request(lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (dispatcher, _hub, server) = pair();
        let dispatcher = Arc::new(dispatcher);
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        let d1 = dispatcher.clone();
        let first = tokio::spawn(async move { d1.call("version", Value::Null, T).await });
        let req1 = read_request(&mut lines).await;

        let d2 = dispatcher.clone();
        let second = tokio::spawn(async move { d2.call("listContacts", json!({}), T).await });
        let req2 = read_request(&mut lines).await;
        assert_ne!(req1["id"], req2["id"]);

        let reply2 = json!({"jsonrpc": "2.0", "id": req2["id"], "result": ["contacts"]});
        let reply1 = json!({"jsonrpc": "2.0", "id": req1["id"], "result": {"version": "0.13.4"}});
        write.write_all(format!("{}\n{}\n", reply2, reply1).as_bytes()).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap()["version"], "0.13.4");
        assert_eq!(second.await.unwrap().unwrap(), json!(["contacts"]));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_error_is_surfaced() {
        let (dispatcher, _hub, server) = pair();
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        let call = dispatcher.call("send", json!({"recipient": ["+1"], "message": "x"}), T);
        let respond = async {
            let req = read_request(&mut lines).await;
            let reply = json!({"id": req["id"], "error": {"code": -1, "message": "Unregistered user"}});
            write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        };
        let (outcome, _) = tokio::join!(call, respond);
        assert_eq!(
            outcome,
            Err(RpcError::Remote {
                code: -1,
                message: "Unregistered user".into()
            })
        );
    }

    #[tokio::test]
    async fn timeout_leaves_no_pending_entry() {
        let (dispatcher, _hub, _server) = pair();
        let outcome = dispatcher
            .call("listGroups", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded() {
        let (dispatcher, _hub, server) = pair();
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        let outcome = dispatcher.call("version", Value::Null, Duration::from_millis(50)).await;
        assert!(matches!(outcome, Err(RpcError::Timeout { .. })));
        let stale = read_request(&mut lines).await;

        let call = dispatcher.call("version", Value::Null, T);
        let respond = async {
            let fresh = read_request(&mut lines).await;
            let late = json!({"id": stale["id"], "result": "stale"});
            let good = json!({"id": fresh["id"], "result": "fresh"});
            write.write_all(format!("{}\n{}\n", late, good).as_bytes()).await.unwrap();
        };
        let (outcome, _) = tokio::join!(call, respond);
        assert_eq!(outcome.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_calls() {
        let (dispatcher, _hub, server) = pair();
        let (read, write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        let call = dispatcher.call("send", json!({}), T);
        let hang_up = async {
            let _ = read_request(&mut lines).await;
            drop(write);
            drop(lines);
        };
        let (outcome, _) = tokio::join!(call, hang_up);
        assert_eq!(outcome, Err(RpcError::ConnectionLost));

        tokio::time::timeout(T, dispatcher.closed()).await.unwrap();
        assert!(dispatcher.is_closed());
        assert_eq!(
            dispatcher.call("send", json!({}), T).await,
            Err(RpcError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn dropped_call_future_clears_pending() {
        let (dispatcher, _hub, _server) = pair();
        {
            let call = dispatcher.call("listContacts", Value::Null, T);
            let _ = tokio::time::timeout(Duration::from_millis(20), call).await;
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn notifications_and_garbage_become_events() {
        let (dispatcher, _hub, mut server) = pair();
        let mut sub = dispatcher.subscribe(EventFilter::only([
            EventKind::Message,
            EventKind::Contacts,
            EventKind::ProtocolError,
        ]));

        let frame = json!({"method": "receive", "params": {"envelope": {
            "sourceNumber": "+15551234567", "timestamp": 1, "dataMessage": {"message": "hi"}
        }}});
        server
            .write_all(format!("{}\nnot json\n{{\"contacts_changed\":true}}\n", frame).as_bytes())
            .await
            .unwrap();

        assert!(matches!(sub.recv().await, Ok(Event::IncomingMessage(m)) if m.body == "hi"));
        assert!(matches!(sub.recv().await, Ok(Event::ProtocolError { .. })));
        assert!(matches!(sub.recv().await, Ok(Event::ContactsChanged(_))));
        assert!(!dispatcher.is_closed());
        assert!(matches!(sub.try_recv(), None | Some(Err(RecvError::Lagged(_)))));
    }

    #[tokio::test]
    async fn close_stops_receive_loop() {
        let (dispatcher, _hub, _server) = pair();
        dispatcher.close().await;
        assert!(dispatcher.is_closed());
    }
}
