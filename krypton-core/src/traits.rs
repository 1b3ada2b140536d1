// ABOUTME: Protocol seam between the bot core and the external messaging library
// ABOUTME: Defines Connector/Transport traits plus the inbound event and envelope types

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

use crate::credentials::AuthCredentials;

// =============================================================================
// Message Content Types
// =============================================================================

/// Content that can be sent to a chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plain text message
    Text(String),
    /// Image with an optional caption
    Image {
        data: Vec<u8>,
        mime_type: String,
        caption: Option<String>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn png(data: Vec<u8>) -> Self {
        Self::Image {
            data,
            mime_type: "image/png".to_string(),
            caption: None,
        }
    }
}

// =============================================================================
// Inbound Message
// =============================================================================

/// Inbound chat message as delivered by the protocol library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Protocol message ID
    pub id: String,
    /// Conversation the message arrived in (a direct chat or a group)
    pub from: String,
    /// Author of the message. Equal to `from` in direct chats.
    pub sender: String,
    /// Display name pushed by the sender's client
    pub push_name: Option<String>,
    /// Text body (conversation text or media caption)
    pub body: String,
    /// Whether `from` is a group conversation
    pub is_group: bool,
    /// Whether the bot itself sent this message
    pub from_me: bool,
    /// Timestamp in seconds since Unix epoch
    pub timestamp: i64,
}

impl MessageEnvelope {
    /// Direct-chat message helper
    pub fn direct(id: impl Into<String>, sender: impl Into<String>, body: impl Into<String>) -> Self {
        let sender = sender.into();
        Self {
            id: id.into(),
            from: sender.clone(),
            sender,
            push_name: None,
            body: body.into(),
            is_group: false,
            from_me: false,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

// =============================================================================
// Connection Lifecycle
// =============================================================================

/// Connection phase reported by the protocol library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

/// Reason attached to a close event, decoded from the library's status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Device was unlinked; stored credentials are no longer valid
    LoggedOut,
    Forbidden,
    /// Covers both "connection lost" and "timed out" (same status code)
    ConnectionLost,
    MultiDeviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultiDeviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultiDeviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Other(code) => *code,
        }
    }

    /// Only a logout invalidates the stored credentials
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection_lost",
            Self::MultiDeviceMismatch => "multi_device_mismatch",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RestartRequired => "restart_required",
            Self::Other(_) => "other",
        };
        write!(f, "{} ({})", name, self.status_code())
    }
}

/// One connection-update signal. Any combination of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    pub last_disconnect: Option<DisconnectReason>,
    /// Raw pairing string to be rendered as a QR code
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn connecting() -> Self {
        Self {
            connection: Some(ConnectionState::Connecting),
            ..Self::default()
        }
    }

    pub fn open() -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            ..Self::default()
        }
    }

    pub fn close(reason: DisconnectReason) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(reason),
            qr: None,
        }
    }

    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            qr: Some(code.into()),
            ..Self::default()
        }
    }
}

// =============================================================================
// Group and Contact Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Add,
    Remove,
    Promote,
    Demote,
}

/// Membership change in a group conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupParticipantsUpdate {
    pub group_id: String,
    pub participants: Vec<String>,
    pub action: GroupAction,
}

/// Contact metadata change (display name, notify name)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUpdate {
    pub id: String,
    pub name: Option<String>,
    pub notify: Option<String>,
}

// =============================================================================
// Protocol Events
// =============================================================================

/// Every inbound event the protocol library can emit
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Connection(ConnectionUpdate),
    MessagesUpsert(Vec<MessageEnvelope>),
    GroupParticipantsUpdate(GroupParticipantsUpdate),
    ContactsUpdate(Vec<ContactUpdate>),
    CredentialsUpdate(AuthCredentials),
}

impl ProtocolEvent {
    /// Short category name used in logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection.update",
            Self::MessagesUpsert(_) => "messages.upsert",
            Self::GroupParticipantsUpdate(_) => "group-participants.update",
            Self::ContactsUpdate(_) => "contacts.update",
            Self::CredentialsUpdate(_) => "creds.update",
        }
    }
}

/// Boxed stream type for protocol events
pub type EventStream = Pin<Box<dyn Stream<Item = ProtocolEvent> + Send>>;

// =============================================================================
// Connector / Transport
// =============================================================================

/// Protocol version negotiated before each connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolVersion(pub u32, pub u32, pub u32);

impl ProtocolVersion {
    /// Used when version negotiation fails
    pub const FALLBACK: ProtocolVersion = ProtocolVersion(2, 3000, 1015901307);
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// Outbound half of a live protocol connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a chat, optionally quoting an inbound message
    async fn send(
        &self,
        chat_id: &str,
        content: MessageContent,
        quoted: Option<&MessageEnvelope>,
    ) -> Result<()>;

    /// The bot's own identity once paired
    fn self_id(&self) -> Option<String> {
        None
    }

    /// Tear down the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A freshly opened protocol connection
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: EventStream,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &"<Transport>")
            .field("events", &"<EventStream>")
            .finish()
    }
}

/// Factory for protocol connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Ask the network for its current protocol version
    async fn latest_version(&self) -> Result<ProtocolVersion> {
        Ok(ProtocolVersion::FALLBACK)
    }

    /// Open a new connection using the given credentials
    async fn connect(
        &self,
        credentials: AuthCredentials,
        version: ProtocolVersion,
    ) -> Result<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_logout_is_terminal() {
        assert!(DisconnectReason::LoggedOut.is_terminal());
        for code in [403, 408, 411, 428, 440, 500, 503, 515, 999] {
            assert!(
                !DisconnectReason::from_status_code(code).is_terminal(),
                "status {} must be transient",
                code
            );
        }
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            DisconnectReason::from_status_code(401),
            DisconnectReason::LoggedOut
        );
        assert_eq!(
            DisconnectReason::from_status_code(515),
            DisconnectReason::RestartRequired
        );
        assert_eq!(
            DisconnectReason::from_status_code(418),
            DisconnectReason::Other(418)
        );
        assert_eq!(DisconnectReason::Other(418).status_code(), 418);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::LoggedOut.to_string(),
            "logged_out (401)"
        );
    }

    #[test]
    fn test_connection_update_builders() {
        let close = ConnectionUpdate::close(DisconnectReason::ConnectionLost);
        assert_eq!(close.connection, Some(ConnectionState::Close));
        assert_eq!(close.last_disconnect, Some(DisconnectReason::ConnectionLost));

        let qr = ConnectionUpdate::qr("2@abc");
        assert!(qr.connection.is_none());
        assert_eq!(qr.qr.as_deref(), Some("2@abc"));
    }

    #[test]
    fn test_direct_envelope() {
        let msg = MessageEnvelope::direct("m1", "123@s.whatsapp.net", "!ping");
        assert_eq!(msg.from, msg.sender);
        assert!(!msg.is_group);
    }
}
