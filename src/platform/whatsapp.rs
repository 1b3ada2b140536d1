// ABOUTME: WhatsApp connector built on whatsapp-rust
// ABOUTME: Translates library events into ProtocolEvents and sends outbound messages

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use krypton_core::{
    AuthCredentials, Connection, ConnectionUpdate, Connector, DisconnectReason, MessageContent,
    MessageEnvelope, ProtocolEvent, ProtocolVersion, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use waproto::whatsapp as wa;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust::download::MediaType;
use whatsapp_rust::store::SqliteStore;
use whatsapp_rust::types::events::Event;
use whatsapp_rust::types::message::MessageInfo;
use whatsapp_rust::Jid;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

const STORE_FILE: &str = "whatsapp.db";

/// Opens whatsapp-rust sessions whose device store lives in the session directory
pub struct WhatsAppConnector {
    session_dir: PathBuf,
}

impl WhatsAppConnector {
    pub fn new(session_dir: impl Into<PathBuf>) -> Self {
        Self {
            session_dir: session_dir.into(),
        }
    }
}

#[async_trait]
impl Connector for WhatsAppConnector {
    async fn connect(
        &self,
        credentials: AuthCredentials,
        version: ProtocolVersion,
    ) -> Result<Connection> {
        tokio::fs::create_dir_all(&self.session_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.session_dir.display()))?;
        let db = self.session_dir.join(STORE_FILE);
        let backend = Arc::new(
            SqliteStore::new(&db.to_string_lossy())
                .await
                .with_context(|| format!("Failed to open device store {}", db.display()))?,
        );

        tracing::debug!(
            store = %db.display(),
            version = %version,
            identity = ?credentials.identity,
            "Opening WhatsApp session"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let events_tx = tx.clone();
        let mut bot = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let tx = events_tx.clone();
                async move {
                    if let Some(event) = translate(event) {
                        // Receiver gone means the session moved on
                        let _ = tx.send(event);
                    }
                }
            })
            .build()
            .await
            .context("Failed to build WhatsApp client")?;

        let client = bot.client();
        let _ = tx.send(ProtocolEvent::Connection(ConnectionUpdate::connecting()));
        let run = bot
            .run()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start WhatsApp client: {}", e))?;

        let transport = Arc::new(WhatsAppTransport {
            client,
            run: Mutex::new(Some(run)),
            _bot: Mutex::new(bot),
        });
        Ok(Connection {
            transport,
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }
}

/// Map one library event to the protocol seam; None for events the core ignores
fn translate(event: Event) -> Option<ProtocolEvent> {
    match event {
        Event::PairingQrCode { code, .. } => {
            Some(ProtocolEvent::Connection(ConnectionUpdate::qr(code)))
        }
        Event::Connected(_) => Some(ProtocolEvent::Connection(ConnectionUpdate::open())),
        Event::Disconnected(_) => Some(ProtocolEvent::Connection(ConnectionUpdate::close(
            DisconnectReason::ConnectionLost,
        ))),
        Event::LoggedOut(_) => Some(ProtocolEvent::Connection(ConnectionUpdate::close(
            DisconnectReason::LoggedOut,
        ))),
        Event::PairSuccess(pair) => Some(ProtocolEvent::CredentialsUpdate(AuthCredentials {
            identity: Some(pair.id.to_string()),
            version: 1,
            data: serde_json::json!({ "store": STORE_FILE, "platform": pair.platform }),
            updated_at: Some(Utc::now()),
        })),
        Event::PairError(e) => {
            tracing::warn!(error = ?e, "WhatsApp pairing failed");
            None
        }
        Event::Message(message, info) => {
            Some(ProtocolEvent::MessagesUpsert(vec![envelope(&message, &info)]))
        }
        _ => None,
    }
}

fn envelope(message: &wa::Message, info: &MessageInfo) -> MessageEnvelope {
    let body = message
        .conversation
        .clone()
        .or_else(|| {
            message
                .extended_text_message
                .as_ref()
                .and_then(|m| m.text.clone())
        })
        .or_else(|| message.image_message.as_ref().and_then(|m| m.caption.clone()))
        .unwrap_or_default();

    MessageEnvelope {
        id: info.id.clone(),
        from: info.source.chat.to_string(),
        sender: info.source.sender.to_string(),
        push_name: Some(info.push_name.clone()).filter(|n| !n.is_empty()),
        body,
        is_group: info.source.is_group,
        from_me: info.source.is_from_me,
        timestamp: info.timestamp.timestamp(),
    }
}

/// Reply metadata that makes the client render the quoted bubble
fn quote_context(quoted: &MessageEnvelope) -> wa::ContextInfo {
    wa::ContextInfo {
        stanza_id: Some(quoted.id.clone()),
        participant: Some(quoted.sender.clone()),
        quoted_message: Some(Box::new(wa::Message {
            conversation: Some(quoted.body.clone()),
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Plain text goes out as a conversation; a reply needs the extended form
/// to carry its context
fn outbound_text(text: String, quoted: Option<&MessageEnvelope>) -> wa::Message {
    match quoted {
        None => wa::Message {
            conversation: Some(text),
            ..Default::default()
        },
        Some(quoted) => wa::Message {
            extended_text_message: Some(Box::new(wa::message::ExtendedTextMessage {
                text: Some(text),
                context_info: Some(Box::new(quote_context(quoted))),
                ..Default::default()
            })),
            ..Default::default()
        },
    }
}

/// Outbound half of a whatsapp-rust session
pub struct WhatsAppTransport {
    client: Arc<Client>,
    run: Mutex<Option<JoinHandle<()>>>,
    // Dropping the bot tears the session down
    _bot: Mutex<Bot>,
}

#[async_trait]
impl Transport for WhatsAppTransport {
    async fn send(
        &self,
        chat_id: &str,
        content: MessageContent,
        quoted: Option<&MessageEnvelope>,
    ) -> Result<()> {
        let jid: Jid = chat_id
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid chat id {}: {:?}", chat_id, e))?;

        let message = match content {
            MessageContent::Text(text) => outbound_text(text, quoted),
            MessageContent::Image {
                data,
                mime_type,
                caption,
            } => {
                let upload = self
                    .client
                    .upload(data, MediaType::Image)
                    .await
                    .context("Failed to upload image")?;
                wa::Message {
                    image_message: Some(Box::new(wa::message::ImageMessage {
                        url: Some(upload.url),
                        direct_path: Some(upload.direct_path),
                        media_key: Some(upload.media_key),
                        file_enc_sha256: Some(upload.file_enc_sha256),
                        file_sha256: Some(upload.file_sha256),
                        file_length: Some(upload.file_length),
                        mimetype: Some(mime_type),
                        caption,
                        context_info: quoted.map(|q| Box::new(quote_context(q))),
                        ..Default::default()
                    })),
                    ..Default::default()
                }
            }
        };

        self.client
            .send_message(jid, message)
            .await
            .context("Failed to send WhatsApp message")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.disconnect().await;
        if let Some(run) = self.run.lock().await.take() {
            run.abort();
        }
        Ok(())
    }
}
