// ABOUTME: generateqr command: renders the configured session id as a QR image
// ABOUTME: Only moderator chats get a reply; missing session or name gets a guidance message

use anyhow::Result;
use async_trait::async_trait;
use krypton_core::qr::render_png;
use krypton_core::{Command, CommandDescriptor, MessageContent, MessageEnvelope, SessionContext};

pub const MISSING_SESSION_MESSAGE: &str =
    "Please provide the session and name of the bot for multi-authentication.";

pub struct GenerateQr {
    desc: CommandDescriptor,
}

impl GenerateQr {
    pub fn new() -> Self {
        Self {
            desc: CommandDescriptor::new("generateqr", "dev")
                .aliases(["qr"])
                .description("Generates a QR code for authentication"),
        }
    }
}

impl Default for GenerateQr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for GenerateQr {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.desc
    }

    async fn execute(
        &self,
        session: &SessionContext,
        _flags: &[String],
        _args: &str,
        message: &MessageEnvelope,
    ) -> Result<()> {
        // Keyed on the chat, not the author: the session id is only ever
        // shown in a moderator's private chat, never inside a group
        if !session.is_mod(&message.from) {
            tracing::debug!(chat = %message.from, "generateqr ignored for non-moderator chat");
            return Ok(());
        }

        let bot = &session.config().bot;
        let session_id = bot
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let Some(session_id) = session_id.filter(|_| bot.name.is_some()) else {
            return session
                .send(&message.from, MessageContent::text(MISSING_SESSION_MESSAGE))
                .await;
        };

        let png = render_png(session_id.as_bytes())?;
        session.reply(message, MessageContent::png(png)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krypton_core::testing::{test_config, test_context_with_config};
    use krypton_core::CommandRegistry;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_session_id_rendered_for_moderator() {
        let mut config = test_config();
        config.bot.name = Some("Krypton".to_string());
        config.bot.session_id = Some("KRYPTON-SESSION-42".to_string());
        let (ctx, transport) =
            test_context_with_config(Arc::new(CommandRegistry::new()), config);
        let msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!qr");

        GenerateQr::new().execute(&ctx, &[], "", &msg).await.unwrap();

        let sent = transport.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].quoted.as_deref(), Some("m1"));
        let expected = render_png(b"KRYPTON-SESSION-42").unwrap();
        assert_eq!(sent[0].content, MessageContent::png(expected));
    }

    #[tokio::test]
    async fn test_missing_session_gets_guidance() {
        let (ctx, transport) = test_context_with_config(
            Arc::new(CommandRegistry::new()),
            test_config(),
        );
        let msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!qr");

        GenerateQr::new().execute(&ctx, &[], "", &msg).await.unwrap();

        let sent = transport.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, MessageContent::text(MISSING_SESSION_MESSAGE));
        assert!(sent[0].quoted.is_none());
    }

    #[tokio::test]
    async fn test_other_chats_get_silence() {
        let mut config = test_config();
        config.bot.session_id = Some("KRYPTON-SESSION-42".to_string());
        let (ctx, transport) =
            test_context_with_config(Arc::new(CommandRegistry::new()), config);
        let msg = MessageEnvelope::direct("m1", "stranger@s.whatsapp.net", "!qr");

        GenerateQr::new().execute(&ctx, &[], "", &msg).await.unwrap();
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_unnamed_bot_gets_guidance() {
        let mut config = test_config();
        config.bot.name = None;
        config.bot.session_id = Some("KRYPTON-SESSION-42".to_string());
        let (ctx, transport) =
            test_context_with_config(Arc::new(CommandRegistry::new()), config);
        let msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!qr");

        GenerateQr::new().execute(&ctx, &[], "", &msg).await.unwrap();

        assert_eq!(
            transport.sent().await,
            vec![(
                "mod@s.whatsapp.net".to_string(),
                MessageContent::text(MISSING_SESSION_MESSAGE)
            )]
        );
    }

    #[tokio::test]
    async fn test_moderator_in_group_gets_silence() {
        let mut config = test_config();
        config.bot.name = Some("Krypton".to_string());
        config.bot.session_id = Some("KRYPTON-SESSION-42".to_string());
        let (ctx, transport) =
            test_context_with_config(Arc::new(CommandRegistry::new()), config);
        let mut msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!qr");
        msg.from = "120363025@g.us".to_string();
        msg.is_group = true;

        GenerateQr::new().execute(&ctx, &[], "", &msg).await.unwrap();
        assert!(transport.sent().await.is_empty());
    }
}
