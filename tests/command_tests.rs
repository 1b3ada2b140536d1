// ABOUTME: Tests for the built-in commands dispatched through the registry
// ABOUTME: Covers the QR command's moderator gate and the help menu via aliases

use krypton::commands::{catalog, MISSING_SESSION_MESSAGE};
use krypton_core::qr::render_png;
use krypton_core::testing::{test_config, test_context_with_config};
use krypton_core::{
    CommandRegistry, DispatchOutcome, Dispatcher, MessageContent, MessageEnvelope,
};
use std::sync::Arc;

fn loaded_registry() -> Arc<CommandRegistry> {
    let registry = Arc::new(CommandRegistry::new());
    registry.load(&catalog()).unwrap();
    registry
}

#[tokio::test]
async fn test_qr_alias_renders_session_for_moderator() {
    let registry = loaded_registry();
    let mut config = test_config();
    config.bot.name = Some("Krypton".to_string());
    config.bot.session_id = Some("KRYPTON-SESSION-7".to_string());
    let (ctx, transport) = test_context_with_config(registry.clone(), config);
    let dispatcher = Dispatcher::new(registry, "!");

    let msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!qr");
    let outcome = dispatcher.dispatch(&ctx, &msg).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Invoked {
            command: "generateqr".to_string()
        }
    );
    let sent = transport.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, "mod@s.whatsapp.net");
    assert_eq!(
        sent[0].content,
        MessageContent::png(render_png(b"KRYPTON-SESSION-7").unwrap())
    );
}

#[tokio::test]
async fn test_qr_without_session_sends_guidance() {
    let registry = loaded_registry();
    let (ctx, transport) = test_context_with_config(registry.clone(), test_config());
    let dispatcher = Dispatcher::new(registry, "!");

    let msg = MessageEnvelope::direct("m1", "mod@s.whatsapp.net", "!generateqr");
    dispatcher.dispatch(&ctx, &msg).await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, MessageContent::text(MISSING_SESSION_MESSAGE));
}

#[tokio::test]
async fn test_qr_from_stranger_gets_no_reply() {
    let registry = loaded_registry();
    let mut config = test_config();
    config.bot.session_id = Some("KRYPTON-SESSION-7".to_string());
    let (ctx, transport) = test_context_with_config(registry.clone(), config);
    let dispatcher = Dispatcher::new(registry, "!");

    let msg = MessageEnvelope::direct("m1", "stranger@s.whatsapp.net", "!qr");
    let outcome = dispatcher.dispatch(&ctx, &msg).await;

    // The command runs, it just chooses silence
    assert!(matches!(outcome, DispatchOutcome::Invoked { .. }));
    assert!(transport.sent().await.is_empty());
}

#[tokio::test]
async fn test_menu_alias_replies_quoted() {
    let registry = loaded_registry();
    let (ctx, transport) = test_context_with_config(registry.clone(), test_config());
    let dispatcher = Dispatcher::new(registry, "!");

    let msg = MessageEnvelope::direct("m1", "user@s.whatsapp.net", "!menu");
    let outcome = dispatcher.dispatch(&ctx, &msg).await;

    assert_eq!(
        outcome,
        DispatchOutcome::Invoked {
            command: "help".to_string()
        }
    );
    let sent = transport.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].quoted.as_deref(), Some("m1"));

    // Lookups are exact
    let msg = MessageEnvelope::direct("m2", "user@s.whatsapp.net", "!MENU");
    assert_eq!(
        dispatcher.dispatch(&ctx, &msg).await,
        DispatchOutcome::NotFound {
            token: "MENU".to_string()
        }
    );
    assert_eq!(transport.sent().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_command_is_silent() {
    let registry = loaded_registry();
    let (ctx, transport) = test_context_with_config(registry.clone(), test_config());
    let dispatcher = Dispatcher::new(registry, "!");

    let msg = MessageEnvelope::direct("m1", "user@s.whatsapp.net", "!weather london");
    let outcome = dispatcher.dispatch(&ctx, &msg).await;

    assert_eq!(
        outcome,
        DispatchOutcome::NotFound {
            token: "weather".to_string()
        }
    );
    assert!(transport.sent().await.is_empty());
}
