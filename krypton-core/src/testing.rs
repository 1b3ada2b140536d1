// ABOUTME: In-process mock connector and recording transport for tests.
// ABOUTME: Lets tests script connection events and inspect outbound messages without a network.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::commands::CommandRegistry;
use crate::config::Config;
use crate::credentials::AuthCredentials;
use crate::qr::QrBridge;
use crate::session::{OutboundGate, SessionContext, SessionState};
use crate::traits::{
    Connection, ConnectionUpdate, Connector, DisconnectReason, MessageContent, MessageEnvelope,
    ProtocolEvent, ProtocolVersion, Transport,
};

/// One message captured by [`RecordingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: String,
    pub content: MessageContent,
    /// ID of the quoted inbound message, if any
    pub quoted: Option<String>,
}

/// Transport that records every send instead of delivering it
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: tokio::sync::Mutex<Vec<SentMessage>>,
    closed: AtomicBool,
    self_id: Option<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_self_id(self_id: impl Into<String>) -> Self {
        Self {
            self_id: Some(self_id.into()),
            ..Self::default()
        }
    }

    /// (chat, content) pairs in send order
    pub async fn sent(&self) -> Vec<(String, MessageContent)> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|m| (m.chat_id.clone(), m.content.clone()))
            .collect()
    }

    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        chat_id: &str,
        content: MessageContent,
        quoted: Option<&MessageEnvelope>,
    ) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("transport closed");
        }
        self.sent.lock().await.push(SentMessage {
            chat_id: chat_id.to_string(),
            content,
            quoted: quoted.map(|m| m.id.clone()),
        });
        Ok(())
    }

    fn self_id(&self) -> Option<String> {
        self.self_id.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Config that passes validation, with one moderator
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.database.url = "mongodb://localhost/krypton-test".to_string();
    config.bot.mods = vec!["mod@s.whatsapp.net".to_string()];
    config
}

/// Standalone context backed by a recording transport
pub fn test_context(registry: Arc<CommandRegistry>) -> (SessionContext, Arc<RecordingTransport>) {
    test_context_with_config(registry, test_config())
}

pub fn test_context_with_config(
    registry: Arc<CommandRegistry>,
    config: Config,
) -> (SessionContext, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let (_state_tx, state_rx) = watch::channel(SessionState::Open);
    let context = SessionContext::new(
        transport.clone(),
        Arc::new(config),
        registry,
        Arc::new(QrBridge::new()),
        state_rx,
        OutboundGate::new(),
    );
    (context, transport)
}

// =============================================================================
// Mock connector
// =============================================================================

/// Test-side handle to one mock connection
pub struct MockConnectionHandle {
    events: mpsc::UnboundedSender<ProtocolEvent>,
    pub transport: Arc<RecordingTransport>,
    /// Credentials the session connected with
    pub credentials: AuthCredentials,
}

impl MockConnectionHandle {
    pub fn emit(&self, event: ProtocolEvent) {
        // The session may already have dropped the stream
        let _ = self.events.send(event);
    }

    pub fn open(&self) {
        self.emit(ProtocolEvent::Connection(ConnectionUpdate::open()));
    }

    pub fn close(&self, reason: DisconnectReason) {
        self.emit(ProtocolEvent::Connection(ConnectionUpdate::close(reason)));
    }

    pub fn qr(&self, code: &str) {
        self.emit(ProtocolEvent::Connection(ConnectionUpdate::qr(code)));
    }

    pub fn message(&self, message: MessageEnvelope) {
        self.emit(ProtocolEvent::MessagesUpsert(vec![message]));
    }

    pub fn credentials_update(&self, credentials: AuthCredentials) {
        self.emit(ProtocolEvent::CredentialsUpdate(credentials));
    }

    /// End the event stream without a close event
    pub fn end(self) {}
}

/// Connector handing out scripted in-memory connections
pub struct MockConnector {
    handles_tx: mpsc::UnboundedSender<MockConnectionHandle>,
    handles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockConnectionHandle>>,
    connects: Mutex<Vec<AuthCredentials>>,
    failures: AtomicUsize,
    version_fails: AtomicBool,
    versions: Mutex<Vec<ProtocolVersion>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        Self {
            handles_tx,
            handles_rx: tokio::sync::Mutex::new(handles_rx),
            connects: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            version_fails: AtomicBool::new(false),
            versions: Mutex::new(Vec::new()),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect calls fail
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make version negotiation fail
    pub fn fail_version(&self) {
        self.version_fails.store(true, Ordering::SeqCst);
    }

    /// Number of connect calls, including failed ones
    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Credentials passed to each connect call, in order
    pub fn connected_with(&self) -> Vec<AuthCredentials> {
        self.connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Versions passed to each successful connect call
    pub fn versions(&self) -> Vec<ProtocolVersion> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait for the session to open its next connection
    pub async fn next_connection(&self) -> MockConnectionHandle {
        self.handles_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector owns the sender")
    }

    /// A connection that was already opened, without waiting
    pub async fn try_next_connection(&self) -> Option<MockConnectionHandle> {
        self.handles_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn latest_version(&self) -> Result<ProtocolVersion> {
        if self.version_fails.load(Ordering::SeqCst) {
            anyhow::bail!("version endpoint unreachable");
        }
        Ok(ProtocolVersion(2, 3000, 1))
    }

    async fn connect(
        &self,
        credentials: AuthCredentials,
        version: ProtocolVersion,
    ) -> Result<Connection> {
        self.connects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(credentials.clone());

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("mock connect failure");
        }
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(version);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RecordingTransport::with_self_id("bot@s.whatsapp.net"));
        let handle = MockConnectionHandle {
            events: events_tx,
            transport: transport.clone(),
            credentials,
        };
        if self.handles_tx.send(handle).is_err() {
            anyhow::bail!("mock connector dropped");
        }
        Ok(Connection {
            transport,
            events: Box::pin(UnboundedReceiverStream::new(events_rx)),
        })
    }
}
