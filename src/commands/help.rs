// ABOUTME: help command listing the loaded commands by category
// ABOUTME: `help <command>` shows aliases, category and experience for one command

use anyhow::Result;
use async_trait::async_trait;
use krypton_core::{Command, CommandDescriptor, MessageContent, MessageEnvelope, SessionContext};

pub struct Help {
    desc: CommandDescriptor,
}

impl Help {
    pub fn new() -> Self {
        Self {
            desc: CommandDescriptor::new("help", "general")
                .aliases(["h", "menu"])
                .description("Lists the available commands"),
        }
    }
}

impl Default for Help {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Command for Help {
    fn descriptor(&self) -> &CommandDescriptor {
        &self.desc
    }

    async fn execute(
        &self,
        session: &SessionContext,
        _flags: &[String],
        args: &str,
        message: &MessageEnvelope,
    ) -> Result<()> {
        let prefix = &session.config().bot.prefix;
        let text = match args.split_whitespace().next() {
            Some(token) => {
                let token = token.strip_prefix(prefix.as_str()).unwrap_or(token);
                match session.registry().resolve(token) {
                    Some(command) => describe(command.descriptor(), prefix),
                    // Unknown names stay silent like any other miss
                    None => return Ok(()),
                }
            }
            None => menu(session, prefix),
        };
        session.reply(message, MessageContent::text(text)).await
    }
}

fn menu(session: &SessionContext, prefix: &str) -> String {
    let mut text = format!("*{}* commands\n", session.config().bot.display_name());
    let mut category = String::new();
    for command in session.registry().commands() {
        let desc = command.descriptor();
        if desc.category != category {
            category = desc.category.clone();
            text.push_str(&format!("\n*{}*\n", category.to_uppercase()));
        }
        text.push_str(&format!("{}{}", prefix, desc.name));
        if !desc.description.is_empty() {
            text.push_str(&format!(": {}", desc.description));
        }
        text.push('\n');
    }
    text.push_str(&format!("\nUse {}help <command> for details.", prefix));
    text
}

fn describe(desc: &CommandDescriptor, prefix: &str) -> String {
    let mut text = format!("*{}{}*\n", prefix, desc.name);
    if !desc.description.is_empty() {
        text.push_str(&format!("{}\n", desc.description));
    }
    if !desc.aliases.is_empty() {
        text.push_str(&format!("Aliases: {}\n", desc.aliases.join(", ")));
    }
    text.push_str(&format!("Category: {}", desc.category));
    if desc.min_exp > 0 {
        text.push_str(&format!("\nRequires {} exp", desc.min_exp));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::catalog;
    use krypton_core::testing::test_context;
    use krypton_core::CommandRegistry;
    use std::sync::Arc;

    fn text_of(content: &MessageContent) -> &str {
        match content {
            MessageContent::Text(text) => text,
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_menu_lists_commands_by_category() {
        let registry = Arc::new(CommandRegistry::new());
        registry.load(&catalog()).unwrap();
        let (ctx, transport) = test_context(registry);
        let msg = MessageEnvelope::direct("m1", "user@s.whatsapp.net", "!help");

        Help::new().execute(&ctx, &[], "", &msg).await.unwrap();

        let sent = transport.sent().await;
        let text = text_of(&sent[0].1);
        assert!(text.starts_with("*Krypton* commands"));
        let dev = text.find("*DEV*").unwrap();
        let general = text.find("*GENERAL*").unwrap();
        assert!(dev < general);
        assert!(text.contains("!generateqr: Generates a QR code for authentication"));
        assert!(text.contains("!help: Lists the available commands"));
    }

    #[tokio::test]
    async fn test_details_for_alias() {
        let registry = Arc::new(CommandRegistry::new());
        registry.load(&catalog()).unwrap();
        let (ctx, transport) = test_context(registry);
        let msg = MessageEnvelope::direct("m1", "user@s.whatsapp.net", "!help qr");

        Help::new().execute(&ctx, &[], "qr", &msg).await.unwrap();

        let sent = transport.sent().await;
        let text = text_of(&sent[0].1);
        assert!(text.starts_with("*!generateqr*"));
        assert!(text.contains("Aliases: qr"));
        assert!(text.contains("Category: dev"));
    }

    #[tokio::test]
    async fn test_unknown_command_is_silent() {
        let registry = Arc::new(CommandRegistry::new());
        registry.load(&catalog()).unwrap();
        let (ctx, transport) = test_context(registry);
        let msg = MessageEnvelope::direct("m1", "user@s.whatsapp.net", "!help nope");

        Help::new().execute(&ctx, &[], "nope", &msg).await.unwrap();
        assert!(transport.sent().await.is_empty());
    }
}
