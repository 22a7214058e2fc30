//! The client facade.
//!
//! [`SignalClient`] owns every other component: it starts (or adopts) the
//! daemon through the [`Supervisor`], puts a [`Dispatcher`] on the
//! connection, drives the session state, keeps the contact cache current and
//! recovers from connection loss with bounded retries. It is cheap to clone;
//! all clones share one session.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::cache::{ContactCache, ContactSource, Snapshot};
use crate::config::{ClientConfig, TransportMode};
use crate::error::ClientError;
use crate::rpc::dispatcher::Dispatcher;
use crate::rpc::events::{Event, EventFilter, EventKind};
use crate::rpc::hub::{EventHub, RecvError, Subscription};
use crate::rpc::{RpcBackend, RpcError};
use crate::session::linking::{await_confirmation, request_link_uri, LinkResolution};
use crate::session::{
    DisconnectReason, LinkingSession, LinkingState, LinkingStatus, LinkingStream, SessionMachine,
    SessionState,
};
use crate::supervisor::{DaemonState, Supervisor, SupervisorConfig};
use crate::transport::oneshot::OneShotBackend;
use crate::transport::Connection;
use crate::utils::backoff_delay;

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Contact(String),
    Group(String),
}

impl Target {
    /// Group if `id` names a cached group, contact otherwise.
    pub fn resolve(id: &str, snapshot: &Snapshot) -> Self {
        if snapshot.group(id).is_some() {
            Self::Group(id.to_string())
        } else {
            Self::Contact(id.to_string())
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Contact(id) | Self::Group(id) => id,
        }
    }
}

struct ActiveLink {
    generation: u64,
    cancel: CancellationToken,
}

struct ClientInner {
    config: ClientConfig,
    hub: EventHub,
    cache: ContactCache,
    backend: RwLock<Option<Arc<dyn RpcBackend>>>,
    /// `None` in one-shot mode
    supervisor: Option<tokio::sync::Mutex<Supervisor>>,
    /// The daemon was started with `-a`, so requests carry no account
    daemon_scoped: AtomicBool,
    account: Mutex<Option<String>>,
    session: Mutex<SessionMachine>,
    state_tx: watch::Sender<SessionState>,
    linking: Mutex<Option<ActiveLink>>,
    link_generation: AtomicU64,
    /// Serializes connect/reconnect so only one recovery runs at a time
    recovery: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    pump_started: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn same_backend(a: &Arc<dyn RpcBackend>, b: &Arc<dyn RpcBackend>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn disconnect_reason(err: &ClientError) -> DisconnectReason {
    match err {
        ClientError::ProcessSpawn(msg) | ClientError::Fatal(msg) => {
            DisconnectReason::DaemonFailed(msg.clone())
        }
        ClientError::Shutdown => DisconnectReason::Shutdown,
        _ => DisconnectReason::ConnectionLost,
    }
}

impl ClientInner {
    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Apply a session transition and announce it. Invalid moves are
    /// logged and ignored.
    fn set_state(&self, to: SessionState) -> bool {
        let mut machine = lock(&self.session);
        if *machine.state() == to {
            return true;
        }
        match machine.transition(to.clone()) {
            Ok(from) => {
                tracing::info!("Session: {} -> {}", from, to);
                self.state_tx.send_replace(to.clone());
                drop(machine);
                self.hub.publish(Event::Connectivity(to));
                true
            }
            Err(e) => {
                tracing::warn!("Ignoring session change: {}", e);
                false
            }
        }
    }

    fn current_backend(&self) -> Option<Arc<dyn RpcBackend>> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_backend(&self) -> Result<Arc<dyn RpcBackend>, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        match self.current_backend() {
            Some(b) if !b.is_closed() => Ok(b),
            _ => Err(ClientError::ConnectionLost),
        }
    }

    fn current_account(&self) -> Option<String> {
        lock(&self.account).clone()
    }

    /// Multi-account daemons need to be told which account a request is for.
    fn with_account(&self, mut params: Value) -> Value {
        if self.config.mode != TransportMode::Daemon || self.daemon_scoped.load(Ordering::SeqCst) {
            return params;
        }
        if let (Some(account), Some(map)) = (self.current_account(), params.as_object_mut()) {
            map.entry("account").or_insert_with(|| Value::String(account));
        }
        params
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let backend = self.require_backend()?;
        let params = self.with_account(params);
        Ok(backend.call(method, params, self.config.call_timeout()).await?)
    }

    fn resolve_account(&self) -> Option<String> {
        if let Some(account) = self.current_account() {
            return Some(account);
        }
        let found = crate::session::linked_accounts(&self.config.signal_cli_config_dir)
            .into_iter()
            .next();
        if let Some(account) = &found {
            tracing::info!("Using linked account {} found in {}", account, self.config.signal_cli_config_dir.display());
            *lock(&self.account) = Some(account.clone());
        }
        found
    }

    /// Bring up a backend and settle the session state.
    async fn establish(self: &Arc<Self>) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }

        let (backend, daemon_state) = match &self.supervisor {
            None => {
                let backend: Arc<dyn RpcBackend> = Arc::new(OneShotBackend::new(&self.config));
                (backend, None)
            }
            Some(supervisor) => {
                let (handle, daemon_state) = {
                    let mut supervisor = supervisor.lock().await;
                    let handle = supervisor.ensure_running().await?;
                    (handle, supervisor.watch_state())
                };
                self.daemon_scoped
                    .store(handle.account.is_some(), Ordering::SeqCst);
                let connection = Connection::connect(&handle.endpoint).await?;
                tracing::info!("Connected to signal-cli daemon on {}", handle.endpoint);
                let backend: Arc<dyn RpcBackend> =
                    Arc::new(Dispatcher::new(connection, self.hub.clone()));
                (backend, Some(daemon_state))
            }
        };

        let previous = self
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(backend.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }

        self.ensure_event_pump();
        self.spawn_monitor(backend.clone(), daemon_state);

        match self.resolve_account() {
            Some(account) => {
                backend.set_account(&account);
                self.set_state(SessionState::Linked {
                    account: account.clone(),
                });
                self.spawn_refresh("after connect");
            }
            None => {
                tracing::info!("No linked account yet");
                self.set_state(SessionState::Disconnected {
                    reason: DisconnectReason::NotLinked,
                });
            }
        }
        Ok(())
    }

    /// Watch the backend (and daemon) and start recovery when either dies.
    fn spawn_monitor(
        self: &Arc<Self>,
        backend: Arc<dyn RpcBackend>,
        daemon_state: Option<watch::Receiver<DaemonState>>,
    ) {
        let inner = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let daemon_crashed = async move {
                match daemon_state {
                    Some(mut rx) => {
                        if rx.wait_for(|s| *s == DaemonState::Crashed).await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = backend.closed() => tracing::warn!("Connection to signal-cli closed"),
                _ = daemon_crashed => tracing::warn!("signal-cli daemon crashed"),
            }
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let still_current = inner
                .current_backend()
                .map_or(false, |current| same_backend(&current, &backend));
            if !still_current || inner.shutdown.is_cancelled() {
                return;
            }
            inner.connectivity_lost().await;
        });
    }

    async fn connectivity_lost(self: &Arc<Self>) {
        self.cancel_active_link();
        self.set_state(SessionState::Disconnected {
            reason: DisconnectReason::ConnectionLost,
        });
        if let Err(e) = self.recover().await {
            tracing::error!("Could not recover connection to signal-cli: {}", e);
        }
    }

    fn is_healthy(&self) -> bool {
        self.current_backend().map_or(false, |b| !b.is_closed())
            && !matches!(
                self.state(),
                SessionState::Disconnected {
                    reason: DisconnectReason::ConnectionLost
                        | DisconnectReason::Reconnecting { .. }
                        | DisconnectReason::ReconnectExhausted
                        | DisconnectReason::DaemonFailed(_)
                }
            )
    }

    /// Reconnect with exponential backoff up to the configured attempts.
    async fn recover(self: &Arc<Self>) -> Result<(), ClientError> {
        let _serial = self.recovery.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ClientError::Shutdown);
        }
        if self.is_healthy() {
            return Ok(());
        }

        let attempts = self.config.reconnect.attempts.max(1);
        let initial = Duration::from_millis(self.config.reconnect.backoff_initial_ms);
        let max = Duration::from_millis(self.config.reconnect.backoff_max_ms);

        for attempt in 1..=attempts {
            self.set_state(SessionState::Disconnected {
                reason: DisconnectReason::Reconnecting { attempt },
            });
            let delay = backoff_delay(initial, max, attempt - 1);
            tracing::info!("Reconnecting to signal-cli in {:?} (attempt {}/{})", delay, attempt, attempts);
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ClientError::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(()) => {
                    tracing::info!("Reconnected to signal-cli");
                    return Ok(());
                }
                Err(e @ ClientError::Fatal(_)) => {
                    self.set_state(SessionState::Disconnected {
                        reason: disconnect_reason(&e),
                    });
                    return Err(e);
                }
                Err(ClientError::Shutdown) => return Err(ClientError::Shutdown),
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        self.set_state(SessionState::Disconnected {
            reason: DisconnectReason::ReconnectExhausted,
        });
        Err(ClientError::ReconnectExhausted(attempts))
    }

    /// Keeps the cache in step with incoming events.
    fn ensure_event_pump(self: &Arc<Self>) {
        if self.pump_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let filter = EventFilter::only([EventKind::Message, EventKind::Contacts]);
        let mut sub = self.hub.subscribe(filter.clone());
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = sub.recv().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let event = match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::debug!("Cache pump skipped {} events", n);
                        continue;
                    }
                    Err(RecvError::Overflowed) => {
                        // changes were lost; start over from a full listing
                        tracing::warn!("Cache pump fell behind, resubscribing and refreshing");
                        sub = inner.hub.subscribe(filter.clone());
                        inner.spawn_refresh("after lost events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match event {
                    Event::IncomingMessage(msg) => inner.cache.touch(&msg.sender, msg.timestamp),
                    Event::ContactsChanged(change) => match change.delta {
                        Some(delta) => {
                            inner.cache.apply_delta(&delta).await;
                        }
                        None => inner.spawn_refresh("after change"),
                    },
                    _ => {}
                }
            }
            tracing::debug!("Cache pump stopped");
        });
    }

    fn spawn_refresh(self: &Arc<Self>, why: &'static str) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.refresh_contacts().await {
                tracing::warn!("Contact refresh {} failed: {}", why, e);
            }
        });
    }

    async fn refresh_contacts(&self) -> Result<Arc<Snapshot>, ClientError> {
        let backend = self.require_backend()?;
        let source = BackendSource {
            inner: self,
            backend,
        };
        Ok(self.cache.refresh(&source).await?)
    }

    fn is_active_link(&self, generation: u64) -> bool {
        lock(&self.linking)
            .as_ref()
            .map_or(false, |l| l.generation == generation)
    }

    fn clear_link(&self, generation: u64) {
        let mut active = lock(&self.linking);
        if active.as_ref().map_or(false, |l| l.generation == generation) {
            *active = None;
        }
    }

    fn cancel_active_link(&self) {
        if let Some(link) = lock(&self.linking).take() {
            tracing::info!("Abandoning linking attempt");
            link.cancel.cancel();
        }
    }

    async fn drive_link(
        self: Arc<Self>,
        backend: Arc<dyn RpcBackend>,
        generation: u64,
        cancel: CancellationToken,
        tx: mpsc::Sender<LinkingStatus>,
    ) {
        let requested = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(LinkingStatus::Cancelled).await;
                return;
            }
            r = request_link_uri(backend.as_ref(), self.config.call_timeout()) => r,
        };
        let uri = match requested {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!("startLink failed: {}", e);
                self.finish_link(generation, LinkResolution::Failed(e.to_string()), &backend, &tx)
                    .await;
                return;
            }
        };

        let session = LinkingSession::new(uri.clone(), self.config.linking_expiry());
        tracing::info!("Linking session {} waiting for scan (valid {:?})", session.id, session.remaining());
        let _ = tx.send(LinkingStatus::AwaitingScan { uri }).await;

        let events = backend
            .supports_events()
            .then(|| self.hub.subscribe(EventFilter::only([EventKind::Linking])));
        let resolution = await_confirmation(
            backend.as_ref(),
            &session,
            &self.config.device_name,
            events,
            &cancel,
        )
        .await;
        self.finish_link(generation, resolution, &backend, &tx).await;
    }

    async fn finish_link(
        &self,
        generation: u64,
        resolution: LinkResolution,
        backend: &Arc<dyn RpcBackend>,
        tx: &mpsc::Sender<LinkingStatus>,
    ) {
        if resolution == LinkResolution::Cancelled || !self.is_active_link(generation) {
            let _ = tx.send(LinkingStatus::Cancelled).await;
            return;
        }

        match resolution {
            LinkResolution::Confirmed { account } => {
                let account = account.or_else(|| {
                    crate::session::linked_accounts(&self.config.signal_cli_config_dir)
                        .into_iter()
                        .next()
                });
                let Some(account) = account else {
                    self.link_failed(generation, "linked account could not be determined".into(), tx)
                        .await;
                    return;
                };
                tracing::info!("Device linked to {}", account);
                self.set_state(SessionState::Linking(LinkingState::Confirmed));
                *lock(&self.account) = Some(account.clone());
                backend.set_account(&account);
                let _ = tx
                    .send(LinkingStatus::Confirmed {
                        account: account.clone(),
                    })
                    .await;

                if let Err(e) = self.refresh_contacts().await {
                    tracing::warn!("Initial contact refresh failed: {}", e);
                }
                if self.is_active_link(generation) {
                    self.set_state(SessionState::Linked { account });
                }
                self.clear_link(generation);
            }
            LinkResolution::Expired => {
                tracing::info!("Link code expired before it was scanned");
                self.set_state(SessionState::Linking(LinkingState::Expired));
                self.set_state(SessionState::Disconnected {
                    reason: DisconnectReason::LinkExpired,
                });
                self.restore_previous_link();
                self.clear_link(generation);
                let _ = tx.send(LinkingStatus::Expired).await;
            }
            LinkResolution::Failed(reason) => self.link_failed(generation, reason, tx).await,
            LinkResolution::Cancelled => {}
        }
    }

    /// A re-link that did not finish leaves the earlier account usable.
    fn restore_previous_link(&self) {
        let alive = self.current_backend().map_or(false, |b| !b.is_closed());
        if let (true, Some(account)) = (alive, self.current_account()) {
            tracing::info!("Keeping existing link to {}", account);
            self.set_state(SessionState::Linked { account });
        }
    }

    async fn link_failed(&self, generation: u64, reason: String, tx: &mpsc::Sender<LinkingStatus>) {
        tracing::warn!("Linking failed: {}", reason);
        self.set_state(SessionState::Linking(LinkingState::Failed));
        self.set_state(SessionState::Disconnected {
            reason: DisconnectReason::LinkFailed(reason.clone()),
        });
        self.restore_previous_link();
        self.clear_link(generation);
        let _ = tx.send(LinkingStatus::Failed { reason }).await;
    }
}

/// `listContacts` / `listGroups` through whichever backend is current.
struct BackendSource<'a> {
    inner: &'a ClientInner,
    backend: Arc<dyn RpcBackend>,
}

#[async_trait]
impl ContactSource for BackendSource<'_> {
    async fn list_contacts(&self) -> Result<Value, RpcError> {
        let params = self.inner.with_account(json!({}));
        self.backend
            .call("listContacts", params, self.inner.config.call_timeout())
            .await
    }

    async fn list_groups(&self) -> Result<Value, RpcError> {
        let params = self.inner.with_account(json!({}));
        self.backend
            .call("listGroups", params, self.inner.config.call_timeout())
            .await
    }
}

#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<ClientInner>,
}

impl SignalClient {
    /// Build a client without touching signal-cli yet. Call
    /// [`SignalClient::connect`] to bring the session up.
    pub fn new(config: ClientConfig) -> Self {
        let hub = EventHub::from_config(&config.events);
        let cache = ContactCache::open(config.cache_path.clone());
        let supervisor = match config.mode {
            TransportMode::Daemon => Some(tokio::sync::Mutex::new(Supervisor::new(
                SupervisorConfig::from_client_config(&config),
            ))),
            TransportMode::OneShot => None,
        };
        let account = config.account.clone().filter(|a| !a.is_empty());
        let (state_tx, _) = watch::channel(SessionState::default());

        Self {
            inner: Arc::new(ClientInner {
                config,
                hub,
                cache,
                backend: RwLock::new(None),
                supervisor,
                daemon_scoped: AtomicBool::new(false),
                account: Mutex::new(account),
                session: Mutex::new(SessionMachine::new()),
                state_tx,
                linking: Mutex::new(None),
                link_generation: AtomicU64::new(0),
                recovery: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                pump_started: AtomicBool::new(false),
            }),
        }
    }

    /// Build and connect. A failed connect leaves the client `Disconnected`
    /// with the reason set; it can be retried with [`SignalClient::reconnect`].
    pub async fn start(config: ClientConfig) -> Self {
        let client = Self::new(config);
        if let Err(e) = client.connect().await {
            tracing::error!("Failed to connect to signal-cli: {}", e);
        }
        client
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        let _serial = self.inner.recovery.lock().await;
        match self.inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.set_state(SessionState::Disconnected {
                    reason: disconnect_reason(&e),
                });
                Err(e)
            }
        }
    }

    /// Retry the connection after recovery gave up.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.inner.recover().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn account(&self) -> Option<String> {
        self.inner.current_account()
    }

    /// Start linking this device. A linking attempt already in progress is
    /// superseded and its stream ends with `Cancelled`.
    pub async fn start_linking(&self) -> Result<LinkingStream, ClientError> {
        let inner = &self.inner;
        let backend = inner.require_backend()?;

        let awaiting = SessionState::Linking(LinkingState::AwaitingScan);
        {
            let machine = lock(&inner.session);
            if *machine.state() != awaiting && !machine.can_transition(&awaiting) {
                return Err(ClientError::InvalidRequest(format!(
                    "cannot start linking while {}",
                    machine.state()
                )));
            }
        }

        let generation = inner.link_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let previous = lock(&inner.linking).replace(ActiveLink {
            generation,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            tracing::info!("Superseding previous linking attempt");
            previous.cancel.cancel();
        }

        if !inner.set_state(awaiting) {
            inner.clear_link(generation);
            return Err(ClientError::InvalidRequest(format!(
                "cannot start linking while {}",
                inner.state()
            )));
        }

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(self.inner.clone().drive_link(backend, generation, cancel, tx));
        Ok(LinkingStream::new(rx))
    }

    /// Abandon the current linking attempt, if any.
    pub fn cancel_linking(&self) {
        let inner = &self.inner;
        let Some(link) = lock(&inner.linking).take() else {
            return;
        };
        link.cancel.cancel();
        if !matches!(inner.state(), SessionState::Linking(_)) {
            return;
        }
        inner.set_state(SessionState::Disconnected {
            reason: DisconnectReason::LinkCancelled,
        });
        inner.restore_previous_link();
    }

    /// Send a text message; returns the Signal timestamp of the sent message.
    pub async fn send_message(&self, target: &Target, body: &str) -> Result<u64, ClientError> {
        if !self.state().is_linked() {
            return Err(ClientError::NotLinked);
        }
        if body.is_empty() {
            return Err(ClientError::InvalidRequest("message body is empty".into()));
        }
        let params = match target {
            Target::Contact(id) => json!({ "recipient": [id], "message": body }),
            Target::Group(id) => json!({ "groupId": id, "message": body }),
        };
        let result = self.inner.call("send", params).await?;
        let timestamp = result
            .get("timestamp")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        tracing::debug!("Sent message to {} at {}", target.id(), timestamp);
        Ok(timestamp)
    }

    /// Current contacts and groups. Never blocks on the network.
    pub fn list_contacts(&self) -> Arc<Snapshot> {
        self.inner.cache.snapshot()
    }

    pub fn contact_name(&self, id: &str) -> String {
        self.inner.cache.snapshot().display_name(id)
    }

    pub async fn refresh_contacts(&self) -> Result<Arc<Snapshot>, ClientError> {
        if !self.state().is_linked() {
            return Err(ClientError::NotLinked);
        }
        self.inner.refresh_contacts().await
    }

    /// Subscribe to session events. One-shot mode has no event stream; the
    /// subscription is closed from the start.
    pub fn subscribe_events(&self, filter: EventFilter) -> Subscription {
        match self.inner.current_backend() {
            Some(backend) if !backend.supports_events() => Subscription::closed(),
            _ if self.inner.config.mode == TransportMode::OneShot => Subscription::closed(),
            _ => self.inner.hub.subscribe(filter),
        }
    }

    /// Trust every known identity key of `recipient`.
    pub async fn trust_identity(&self, recipient: &str) -> Result<(), ClientError> {
        if !self.state().is_linked() {
            return Err(ClientError::NotLinked);
        }
        self.inner
            .call(
                "trust",
                json!({ "recipient": [recipient], "trustAllKnownKeys": true }),
            )
            .await?;
        Ok(())
    }

    /// Ask the primary device to resend contacts and groups.
    pub async fn request_contact_sync(&self) -> Result<(), ClientError> {
        if !self.state().is_linked() {
            return Err(ClientError::NotLinked);
        }
        self.inner.call("sendSyncRequest", json!({})).await?;
        Ok(())
    }

    /// Accounts signal-cli already holds credentials for.
    pub fn linked_accounts(&self) -> Vec<String> {
        crate::session::linked_accounts(&self.inner.config.signal_cli_config_dir)
    }

    pub fn is_cli_installed(&self) -> bool {
        crate::utils::find_executable(&self.inner.config.signal_cli_path).is_some()
    }

    pub async fn cli_version(&self) -> Option<String> {
        crate::transport::oneshot::cli_version(&self.inner.config.signal_cli_path).await
    }

    /// Tear everything down. Pending calls fail with `ConnectionLost`, a
    /// daemon this client started is stopped, subscriptions end.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Shutting down signal client");
        inner.shutdown.cancel();
        inner.cancel_active_link();

        let _serial = inner.recovery.lock().await;
        let backend = inner
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(backend) = backend {
            backend.close().await;
        }
        if let Some(supervisor) = &inner.supervisor {
            supervisor.lock().await.stop().await;
        }
        inner.set_state(SessionState::Disconnected {
            reason: DisconnectReason::Shutdown,
        });
        inner.hub.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Contact, Group};
    use crate::rpc::events::{ContactsChanged, ContactsDelta};
    use std::collections::BTreeMap;

    #[test]
    fn target_resolves_groups_from_cache() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "Z3JvdXA=".to_string(),
            Group {
                id: "Z3JvdXA=".into(),
                name: "Climbing".into(),
                members: Default::default(),
                is_blocked: false,
            },
        );
        let snapshot = Snapshot {
            contacts: BTreeMap::<String, Contact>::new(),
            groups,
            refreshed_at: None,
            stale: false,
        };
        assert_eq!(
            Target::resolve("Z3JvdXA=", &snapshot),
            Target::Group("Z3JvdXA=".into())
        );
        assert_eq!(
            Target::resolve("+15551234567", &snapshot),
            Target::Contact("+15551234567".into())
        );
    }

    #[test]
    fn failures_map_to_disconnect_reasons() {
        assert_eq!(
            disconnect_reason(&ClientError::Fatal("crash loop".into())),
            DisconnectReason::DaemonFailed("crash loop".into())
        );
        assert_eq!(
            disconnect_reason(&ClientError::Connect("refused".into())),
            DisconnectReason::ConnectionLost
        );
    }

    #[tokio::test]
    async fn send_requires_link() {
        let client = SignalClient::new(ClientConfig::default());
        assert!(matches!(client.state(), SessionState::Disconnected { .. }));
        let err = client
            .send_message(&Target::Contact("+15551234567".into()), "hi")
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::NotLinked);
    }

    fn delta_adding(number: &str, name: &str) -> ContactsDelta {
        ContactsDelta {
            contacts: vec![Contact::from_signal_cli(&json!({"number": number, "name": name})).unwrap()],
            groups: vec![],
            removed: vec![],
        }
    }

    #[tokio::test]
    async fn cache_pump_survives_overflow() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = ClientConfig::default();
        config.cache_path = tmp.path().join("contacts.json");
        config.events.buffer = 1;
        config.events.message_buffer = 2;
        let client = SignalClient::new(config);
        client.inner.ensure_event_pump();

        // no yield in between, so the pump's queue overflows
        for i in 0..10 {
            client.inner.hub.publish(Event::ContactsChanged(ContactsChanged {
                delta: Some(delta_adding(&format!("+1555000000{}", i), "Burst")),
            }));
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while client.list_contacts().contact("+15559999999").is_none() {
            assert!(tokio::time::Instant::now() < deadline, "pump stopped after overflow");
            client.inner.hub.publish(Event::ContactsChanged(ContactsChanged {
                delta: Some(delta_adding("+15559999999", "After")),
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.contact_name("+15559999999"), "After");
    }

    #[tokio::test]
    async fn linking_needs_a_backend() {
        let client = SignalClient::new(ClientConfig::default());
        assert!(matches!(
            client.start_linking().await,
            Err(ClientError::ConnectionLost)
        ));
    }
}
