// ABOUTME: Platform-agnostic session lifecycle and command dispatch for chat bots
// ABOUTME: Provides traits, credential storage, QR bridge, registry, dispatcher and session manager

pub mod commands;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod paths;
pub mod qr;
pub mod router;
pub mod session;
pub mod testing;
pub mod traits;

pub use commands::{
    parse_message, Command, CommandCatalog, CommandDescriptor, CommandRegistry, CollisionPolicy,
    ParseResult, ParsedCommand, RegistryError,
};
pub use credentials::{AuthCredentials, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use dispatcher::{DispatchOutcome, Dispatcher, ExperienceSource, IgnoreMessages, MessageHandler};
pub use config::Config;
pub use qr::{QrBridge, QrPayload};
pub use router::{
    ContactHandler, EventRouter, GroupEventHandler, Handlers, LogContacts, LogGroupEvents,
    RouterQueues,
};
pub use session::{
    OutboundGate, SessionContext, SessionManager, SessionManagerBuilder, SessionSnapshot, SessionState,
};

// Re-export core traits for convenient access
pub use traits::{
    // Protocol seam
    Connection, Connector, EventStream, Transport,
    // Data types
    ConnectionState, ConnectionUpdate, ContactUpdate, DisconnectReason, GroupAction,
    GroupParticipantsUpdate, MessageContent, MessageEnvelope, ProtocolEvent, ProtocolVersion,
};
