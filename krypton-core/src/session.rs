// ABOUTME: Connection state machine: connect, fixed-delay reconnect, logout handling
// ABOUTME: Owns the single restart slot and the SessionContext handed to every handler

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::commands::{CommandCatalog, CommandRegistry};
use crate::config::Config;
use crate::credentials::{AuthCredentials, CredentialStore};
use crate::dispatcher::Dispatcher;
use crate::qr::QrBridge;
use crate::router::{EventRouter, Handlers, RouterQueues};
use crate::traits::{
    ConnectionState, ConnectionUpdate, Connector, DisconnectReason, EventStream, MessageContent,
    MessageEnvelope, ProtocolEvent, ProtocolVersion, Transport,
};

/// Lifecycle phase of the one live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
    /// Logged out; credentials wiped, waiting to pair again
    Reauthenticating,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Reauthenticating => "reauthenticating",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the session for health reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Incremented on every connect attempt
    pub connection_id: u64,
    /// Connect attempts since the last successful open
    pub attempts: u32,
    pub last_disconnect: Option<DisconnectReason>,
    pub restart_pending: bool,
}

// =============================================================================
// SessionContext
// =============================================================================

/// Holds outbound traffic back while a credentials change is persisted.
///
/// Sends share the lock; a credentials save takes it exclusively, so no
/// message leaves between the change signal and the completed save.
#[derive(Debug, Clone, Default)]
pub struct OutboundGate(Arc<RwLock<()>>);

impl OutboundGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sending(&self) -> RwLockReadGuard<'_, ()> {
        self.0.read().await
    }

    pub async fn persisting(&self) -> RwLockWriteGuard<'_, ()> {
        self.0.write().await
    }
}

/// Handle passed to every command and event handler
#[derive(Clone)]
pub struct SessionContext {
    transport: Arc<dyn Transport>,
    config: Arc<Config>,
    registry: Arc<CommandRegistry>,
    qr: Arc<QrBridge>,
    state: watch::Receiver<SessionState>,
    outbound: OutboundGate,
}

impl SessionContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<Config>,
        registry: Arc<CommandRegistry>,
        qr: Arc<QrBridge>,
        state: watch::Receiver<SessionState>,
        outbound: OutboundGate,
    ) -> Self {
        Self {
            transport,
            config,
            registry,
            qr,
            state,
            outbound,
        }
    }

    pub async fn send(&self, chat_id: &str, content: MessageContent) -> Result<()> {
        let _gate = self.outbound.sending().await;
        self.transport.send(chat_id, content, None).await
    }

    /// Send to the message's conversation, quoting it
    pub async fn reply(&self, message: &MessageEnvelope, content: MessageContent) -> Result<()> {
        let _gate = self.outbound.sending().await;
        self.transport.send(&message.from, content, Some(message)).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn qr(&self) -> &Arc<QrBridge> {
        &self.qr
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_mod(&self, id: &str) -> bool {
        self.config.is_mod(id)
    }

    pub fn self_id(&self) -> Option<String> {
        self.transport.self_id()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("bot", &self.config.bot.display_name())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// SessionManager
// =============================================================================

#[derive(Default)]
struct Status {
    connection_id: u64,
    attempts: u32,
    last_disconnect: Option<DisconnectReason>,
    context: Option<SessionContext>,
    connection_cancel: Option<CancellationToken>,
    last_credentials: Option<AuthCredentials>,
}

#[derive(Default)]
struct RestartSlot {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    catalog: CommandCatalog,
    registry: Arc<CommandRegistry>,
    qr: Arc<QrBridge>,
    router: Arc<EventRouter>,
    state_tx: watch::Sender<SessionState>,
    outbound: OutboundGate,
    status: Mutex<Status>,
    restart: Mutex<RestartSlot>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Drives one logical session through connect, reconnect and logout
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

pub struct SessionManagerBuilder {
    config: Config,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    catalog: CommandCatalog,
    handlers: Handlers,
    qr: Option<Arc<QrBridge>>,
    registry: Option<Arc<CommandRegistry>>,
}

impl SessionManagerBuilder {
    pub fn catalog(mut self, catalog: CommandCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Share a QR bridge with the HTTP server
    pub fn qr(mut self, qr: Arc<QrBridge>) -> Self {
        self.qr = Some(qr);
        self
    }

    pub fn registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> SessionManager {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CommandRegistry::new()));
        let qr = self.qr.unwrap_or_else(|| Arc::new(QrBridge::new()));

        let mut dispatcher = Dispatcher::new(Arc::clone(&registry), self.config.bot.prefix.clone())
            .with_fallback(self.handlers.messages);
        if let Some(experience) = self.handlers.experience {
            dispatcher = dispatcher.with_experience(experience);
        }
        if let Some(limit) = self.config.bot.command_timeout() {
            dispatcher = dispatcher.with_timeout(limit);
        }
        let router = Arc::new(EventRouter::new(
            dispatcher,
            self.handlers.groups,
            self.handlers.contacts,
            Arc::clone(&self.credentials),
        ));
        let (state_tx, _) = watch::channel(SessionState::Closed);

        SessionManager {
            inner: Arc::new(Inner {
                config: Arc::new(self.config),
                connector: self.connector,
                credentials: self.credentials,
                catalog: self.catalog,
                registry,
                qr,
                router,
                state_tx,
                outbound: OutboundGate::new(),
                status: Mutex::new(Status::default()),
                restart: Mutex::new(RestartSlot::default()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

/// Poison-tolerant lock; the guarded state stays consistent between statements
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionManager {
    pub fn builder(
        config: Config,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            config,
            connector,
            credentials,
            catalog: CommandCatalog::new(),
            handlers: Handlers::default(),
            qr: None,
            registry: None,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn qr(&self) -> &Arc<QrBridge> {
        &self.inner.qr
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.inner.registry
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Context of the live connection, if any
    pub fn current_context(&self) -> Option<SessionContext> {
        lock(&self.inner.status).context.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let restart_pending = lock(&self.inner.restart).pending.is_some();
        let status = lock(&self.inner.status);
        SessionSnapshot {
            state: self.state(),
            connection_id: status.connection_id,
            attempts: status.attempts,
            last_disconnect: status.last_disconnect,
            restart_pending,
        }
    }

    /// Resolve once the session reaches Open
    pub async fn wait_until_open(&self) -> Result<()> {
        let mut rx = self.inner.state_tx.subscribe();
        rx.wait_for(|state| *state == SessionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("Session manager dropped before opening"))
    }

    /// Open a new protocol connection and start consuming its events.
    /// Returns once the connection is established; failures are returned
    /// without scheduling a retry.
    pub fn start(&self) -> BoxFuture<'static, Result<()>> {
        let manager = self.clone();
        async move { manager.open_connection().await }.boxed()
    }

    /// Start, and on failure schedule another attempt after the restart delay
    pub fn connect(&self) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        async move {
            if let Err(e) = manager.open_connection().await {
                if manager.inner.shutdown.is_cancelled() {
                    return;
                }
                tracing::error!(
                    error = %format!("{:#}", e),
                    delay_ms = manager.inner.config.session.restart_delay_ms,
                    "Failed to start session, retrying"
                );
                manager.set_state(SessionState::Closed);
                manager.schedule_restart();
            }
        }
        .boxed()
    }

    /// Arrange for `connect` to run after the restart delay. Replaces any
    /// restart that is already pending.
    pub fn schedule_restart(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let delay = self.inner.config.session.restart_delay();
        let mut slot = lock(&self.inner.restart);
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(previous) = slot.pending.take() {
            previous.abort();
            tracing::debug!(generation, "Replaced pending restart");
        }

        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        // The slot lock is held until the handle is stored, so the task
        // cannot observe its own slot before it is filled.
        slot.pending = Some(tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut slot = lock(&manager.inner.restart);
                if slot.generation != generation {
                    return;
                }
                slot.pending = None;
            }
            manager.connect().await;
        }));
        tracing::info!(delay_ms = delay.as_millis() as u64, generation, "Restart scheduled");
    }

    fn cancel_restart(&self) {
        let mut slot = lock(&self.inner.restart);
        slot.generation += 1;
        if let Some(pending) = slot.pending.take() {
            pending.abort();
        }
    }

    /// Stop reconnecting, drain handlers, close the transport and persist
    /// the last known credentials
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        tracing::info!("Shutting down session");
        self.inner.shutdown.cancel();
        self.cancel_restart();

        let context = lock(&self.inner.status).context.take();

        self.inner.tracker.close();
        if tokio::time::timeout(drain_timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "In-flight handlers did not finish before shutdown"
            );
        }

        if let Some(context) = context {
            if let Err(e) = context.transport().close().await {
                tracing::warn!(error = %e, "Failed to close transport");
            }
        }

        let last = lock(&self.inner.status).last_credentials.clone();
        if let Some(credentials) = last {
            self.inner
                .credentials
                .save(&credentials)
                .await
                .context("Failed to persist credentials on shutdown")?;
            tracing::debug!("Credentials persisted on shutdown");
        }

        self.set_state(SessionState::Closed);
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    fn is_current(&self, connection_id: u64) -> bool {
        lock(&self.inner.status).connection_id == connection_id
    }

    async fn open_connection(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            anyhow::bail!("Session is shutting down");
        }

        let (connection_id, attempt, cancel) = {
            let mut status = lock(&self.inner.status);
            status.connection_id += 1;
            status.attempts += 1;
            status.context = None;
            if let Some(previous) = status.connection_cancel.take() {
                previous.cancel();
            }
            let cancel = self.inner.shutdown.child_token();
            status.connection_cancel = Some(cancel.clone());
            (status.connection_id, status.attempts, cancel)
        };
        self.set_state(SessionState::Connecting);

        let credentials = self
            .inner
            .credentials
            .load()
            .await
            .context("Failed to load credentials")?;

        let version = match self.inner.connector.latest_version().await {
            Ok(version) => version,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    fallback = %ProtocolVersion::FALLBACK,
                    "Protocol version negotiation failed, using fallback"
                );
                ProtocolVersion::FALLBACK
            }
        };

        tracing::info!(
            connection_id,
            attempt,
            version = %version,
            paired = !credentials.is_empty(),
            "Connecting"
        );

        let connection = self
            .inner
            .connector
            .connect(credentials.clone(), version)
            .await
            .context("Failed to open protocol connection")?;

        let context = SessionContext::new(
            Arc::clone(&connection.transport),
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.qr),
            self.inner.state_tx.subscribe(),
            self.inner.outbound.clone(),
        );

        let superseded = {
            let mut status = lock(&self.inner.status);
            if status.connection_id == connection_id {
                status.context = Some(context.clone());
                status.last_credentials = Some(credentials);
                false
            } else {
                true
            }
        };
        if superseded {
            // A newer attempt started while this one was connecting
            tracing::debug!(connection_id, "Dropping superseded connection");
            if let Err(e) = connection.transport.close().await {
                tracing::debug!(error = %e, "Failed to close superseded transport");
            }
            return Ok(());
        }

        let queues = self.inner.router.spawn_workers(&self.inner.tracker);
        let manager = self.clone();
        self.inner.tracker.spawn(async move {
            manager
                .run_connection(connection_id, context, connection.events, queues, cancel)
                .await;
        });
        Ok(())
    }

    async fn run_connection(
        self,
        connection_id: u64,
        context: SessionContext,
        mut events: EventStream,
        queues: RouterQueues,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(connection_id, "Connection loop cancelled");
                    break;
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                if self.is_current(connection_id) {
                    tracing::warn!(connection_id, "Event stream ended without a close event");
                    self.on_close(connection_id, &context, DisconnectReason::ConnectionLost)
                        .await;
                }
                break;
            };

            match event {
                ProtocolEvent::Connection(update) => {
                    if !self
                        .handle_connection_update(connection_id, &context, update)
                        .await
                    {
                        break;
                    }
                }
                ProtocolEvent::CredentialsUpdate(credentials) => {
                    // Persist before pulling the next event or letting any send through
                    let _persisting = self.inner.outbound.persisting().await;
                    let event = ProtocolEvent::CredentialsUpdate(credentials.clone());
                    match self.inner.router.route(&context, event).await {
                        Ok(()) => {
                            lock(&self.inner.status).last_credentials = Some(credentials);
                        }
                        Err(e) => {
                            tracing::error!(error = %format!("{:#}", e), "Credentials update not persisted");
                        }
                    }
                }
                event => {
                    if let Err(event) = queues.submit(context.clone(), event) {
                        tracing::debug!(category = event.category(), "Unqueued event dropped");
                    }
                }
            }
        }
        tracing::debug!(connection_id, "Connection loop finished");
    }

    /// Returns false once the connection has closed
    async fn handle_connection_update(
        &self,
        connection_id: u64,
        context: &SessionContext,
        update: ConnectionUpdate,
    ) -> bool {
        if !self.is_current(connection_id) {
            tracing::debug!(connection_id, "Ignoring update from superseded connection");
            close_transport(context).await;
            return false;
        }

        if let Some(code) = update.qr {
            match self.inner.qr.publish(&code).await {
                Ok(_) => tracing::info!(
                    "Scan the QR code to pair, or open http://localhost:{}",
                    self.inner.config.server.port
                ),
                Err(e) => tracing::warn!(error = %e, "Failed to render QR code"),
            }
        }

        match update.connection {
            Some(ConnectionState::Connecting) => {
                self.set_state(SessionState::Connecting);
                true
            }
            Some(ConnectionState::Open) => {
                self.on_open(connection_id).await;
                true
            }
            Some(ConnectionState::Close) => {
                let reason = update
                    .last_disconnect
                    .unwrap_or(DisconnectReason::ConnectionLost);
                self.on_close(connection_id, context, reason).await;
                false
            }
            None => true,
        }
    }

    async fn on_open(&self, connection_id: u64) {
        self.inner.qr.invalidate().await;
        {
            let mut status = lock(&self.inner.status);
            status.attempts = 0;
            status.last_disconnect = None;
        }

        match self.inner.registry.load(&self.inner.catalog) {
            Ok(count) => tracing::debug!(commands = count, connection_id, "Command table refreshed"),
            Err(e) => tracing::error!(error = %e, "Command reload failed, keeping previous table"),
        }

        self.set_state(SessionState::Open);
        let name = self.inner.config.bot.display_name();
        tracing::info!(connection_id, bot = %name, "{} is ready", name);
    }

    async fn on_close(&self, connection_id: u64, context: &SessionContext, reason: DisconnectReason) {
        // The dead connection must release the session store before it is wiped
        close_transport(context).await;
        if !self.is_current(connection_id) {
            tracing::debug!(connection_id, reason = %reason, "Ignoring close from superseded connection");
            return;
        }
        {
            let mut status = lock(&self.inner.status);
            status.last_disconnect = Some(reason);
            status.context = None;
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        if reason.is_terminal() {
            self.set_state(SessionState::Reauthenticating);
            tracing::warn!(reason = %reason, "Logged out, clearing stored credentials");
            if let Err(e) = self.inner.credentials.clear().await {
                tracing::error!(error = %format!("{:#}", e), "Failed to clear credentials");
            }
            lock(&self.inner.status).last_credentials = None;
        } else {
            self.set_state(SessionState::Closed);
            tracing::warn!(
                reason = %reason,
                delay_ms = self.inner.config.session.restart_delay_ms,
                "Connection closed, reconnecting"
            );
        }
        self.schedule_restart();
    }
}

async fn close_transport(context: &SessionContext) {
    if let Err(e) = context.transport().close().await {
        tracing::debug!(error = %e, "Transport close after disconnect failed");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
