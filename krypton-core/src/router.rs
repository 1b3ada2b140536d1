// ABOUTME: Demultiplexes inbound protocol events to the dispatcher and external handlers
// ABOUTME: Messages run on one lane per chat; groups and contacts on one sequential worker each

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::credentials::CredentialStore;
use crate::dispatcher::{Dispatcher, ExperienceSource, IgnoreMessages, MessageHandler};
use crate::session::SessionContext;
use crate::traits::{ContactUpdate, GroupParticipantsUpdate, MessageEnvelope, ProtocolEvent};

/// A chat lane with nothing to do for this long shuts down
pub const LANE_IDLE: Duration = Duration::from_secs(300);

/// Receives group membership changes
#[async_trait]
pub trait GroupEventHandler: Send + Sync {
    async fn handle(&self, session: &SessionContext, update: &GroupParticipantsUpdate)
        -> Result<()>;
}

/// Persists contact metadata changes
#[async_trait]
pub trait ContactHandler: Send + Sync {
    async fn save_contacts(&self, session: &SessionContext, contacts: &[ContactUpdate])
        -> Result<()>;
}

/// Default group handler: logs and drops
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGroupEvents;

#[async_trait]
impl GroupEventHandler for LogGroupEvents {
    async fn handle(
        &self,
        _session: &SessionContext,
        update: &GroupParticipantsUpdate,
    ) -> Result<()> {
        tracing::debug!(
            group = %update.group_id,
            action = ?update.action,
            participants = update.participants.len(),
            "Group participants changed"
        );
        Ok(())
    }
}

/// Default contact handler: logs and drops
#[derive(Debug, Default, Clone, Copy)]
pub struct LogContacts;

#[async_trait]
impl ContactHandler for LogContacts {
    async fn save_contacts(
        &self,
        _session: &SessionContext,
        contacts: &[ContactUpdate],
    ) -> Result<()> {
        tracing::debug!(count = contacts.len(), "Contacts updated");
        Ok(())
    }
}

/// External collaborators plugged into the router
#[derive(Clone)]
pub struct Handlers {
    pub messages: Arc<dyn MessageHandler>,
    pub groups: Arc<dyn GroupEventHandler>,
    pub contacts: Arc<dyn ContactHandler>,
    pub experience: Option<Arc<dyn ExperienceSource>>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            messages: Arc::new(IgnoreMessages),
            groups: Arc::new(LogGroupEvents),
            contacts: Arc::new(LogContacts),
            experience: None,
        }
    }
}

pub struct EventRouter {
    dispatcher: Dispatcher,
    groups: Arc<dyn GroupEventHandler>,
    contacts: Arc<dyn ContactHandler>,
    credentials: Arc<dyn CredentialStore>,
}

impl EventRouter {
    pub fn new(
        dispatcher: Dispatcher,
        groups: Arc<dyn GroupEventHandler>,
        contacts: Arc<dyn ContactHandler>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            dispatcher,
            groups,
            contacts,
            credentials,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Hand one event to its handler and wait for it to finish. Messages in a
    /// batch are dispatched one after another.
    pub async fn route(&self, session: &SessionContext, event: ProtocolEvent) -> Result<()> {
        match event {
            ProtocolEvent::MessagesUpsert(messages) => {
                for message in &messages {
                    self.dispatcher.dispatch(session, message).await;
                }
                Ok(())
            }
            ProtocolEvent::GroupParticipantsUpdate(update) => {
                self.groups.handle(session, &update).await
            }
            ProtocolEvent::ContactsUpdate(contacts) => {
                self.contacts.save_contacts(session, &contacts).await
            }
            ProtocolEvent::CredentialsUpdate(credentials) => self
                .credentials
                .save(&credentials)
                .await
                .context("Failed to persist credentials"),
            ProtocolEvent::Connection(_) => {
                tracing::debug!("Connection updates belong to the session manager");
                Ok(())
            }
        }
    }

    /// Start the queue workers on the tracker. Messages fan out to one lane
    /// per chat, so a slow command only holds up its own chat.
    pub fn spawn_workers(self: &Arc<Self>, tracker: &TaskTracker) -> RouterQueues {
        RouterQueues {
            messages: self.spawn_message_worker(tracker),
            groups: self.spawn_worker(tracker, "group-participants.update"),
            contacts: self.spawn_worker(tracker, "contacts.update"),
        }
    }

    fn spawn_worker(self: &Arc<Self>, tracker: &TaskTracker, category: &'static str) -> WorkerTx {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SessionContext, ProtocolEvent)>();
        let router = Arc::clone(self);
        tracker.spawn(async move {
            while let Some((session, event)) = rx.recv().await {
                match AssertUnwindSafe(router.route(&session, event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(category, error = %format!("{:#}", e), "Event handler failed");
                    }
                    Err(_) => {
                        tracing::error!(category, "Event handler panicked");
                    }
                }
            }
            tracing::debug!(category, "Event worker stopped");
        });
        tx
    }

    fn spawn_message_worker(self: &Arc<Self>, tracker: &TaskTracker) -> WorkerTx {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SessionContext, ProtocolEvent)>();
        let router = Arc::clone(self);
        let lanes_tracker = tracker.clone();
        tracker.spawn(async move {
            let mut lanes: HashMap<String, LaneTx> = HashMap::new();
            while let Some((session, event)) = rx.recv().await {
                let messages = match event {
                    ProtocolEvent::MessagesUpsert(messages) => messages,
                    other => {
                        tracing::warn!(category = other.category(), "Not a message event, dropping");
                        continue;
                    }
                };
                lanes.retain(|_, lane| !lane.is_closed());
                for message in messages {
                    let chat = message.from.clone();
                    let mut item = (session.clone(), message);
                    if let Some(lane) = lanes.get(&chat) {
                        match lane.send(item) {
                            Ok(()) => continue,
                            // Lane went idle between the prune and the send
                            Err(mpsc::error::SendError(back)) => item = back,
                        }
                    }
                    let lane = router.spawn_lane(&lanes_tracker, chat.clone());
                    if lane.send(item).is_err() {
                        tracing::warn!(chat = %chat, "Chat lane gone, dropping message");
                    }
                    lanes.insert(chat, lane);
                }
            }
            tracing::debug!(lanes = lanes.len(), "Message worker stopped");
        });
        tx
    }

    /// Dispatch one chat's messages in arrival order until the sender side
    /// drops or the lane sits idle for [`LANE_IDLE`]
    fn spawn_lane(self: &Arc<Self>, tracker: &TaskTracker, chat: String) -> LaneTx {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SessionContext, MessageEnvelope)>();
        let router = Arc::clone(self);
        tracker.spawn(async move {
            loop {
                match tokio::time::timeout(LANE_IDLE, rx.recv()).await {
                    Ok(Some((session, message))) => router.dispatch_in_lane(&session, &message).await,
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        // Messages queued before the close still run
                        while let Ok((session, message)) = rx.try_recv() {
                            router.dispatch_in_lane(&session, &message).await;
                        }
                        break;
                    }
                }
            }
            tracing::trace!(chat = %chat, "Chat lane closed");
        });
        tx
    }

    async fn dispatch_in_lane(&self, session: &SessionContext, message: &MessageEnvelope) {
        let dispatch = self.dispatcher.dispatch(session, message);
        if AssertUnwindSafe(dispatch).catch_unwind().await.is_err() {
            tracing::error!(chat = %message.from, "Message dispatch panicked");
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

type WorkerTx = mpsc::UnboundedSender<(SessionContext, ProtocolEvent)>;
type LaneTx = mpsc::UnboundedSender<(SessionContext, MessageEnvelope)>;

/// Senders feeding the per-category workers of one connection
pub struct RouterQueues {
    messages: WorkerTx,
    groups: WorkerTx,
    contacts: WorkerTx,
}

impl RouterQueues {
    /// Queue an event for its category worker. Returns the event back when
    /// it has no queue (connection and credentials events).
    pub fn submit(
        &self,
        session: SessionContext,
        event: ProtocolEvent,
    ) -> std::result::Result<(), ProtocolEvent> {
        let tx = match event {
            ProtocolEvent::MessagesUpsert(_) => &self.messages,
            ProtocolEvent::GroupParticipantsUpdate(_) => &self.groups,
            ProtocolEvent::ContactsUpdate(_) => &self.contacts,
            other => return Err(other),
        };
        if let Err(mpsc::error::SendError((_, event))) = tx.send((session, event)) {
            tracing::warn!(category = event.category(), "Event worker gone, dropping event");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, CommandCatalog, CommandDescriptor, CommandRegistry};
    use crate::credentials::{AuthCredentials, MemoryCredentialStore};
    use crate::testing::{test_context, RecordingTransport};
    use crate::traits::{GroupAction, MessageContent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingGroups(Mutex<Vec<String>>);

    #[async_trait]
    impl GroupEventHandler for RecordingGroups {
        async fn handle(&self, _s: &SessionContext, update: &GroupParticipantsUpdate) -> Result<()> {
            // Slow handler: ordering must still hold
            tokio::task::yield_now().await;
            self.0.lock().await.push(update.group_id.clone());
            Ok(())
        }
    }

    struct PanickingContacts(AtomicUsize);

    #[async_trait]
    impl ContactHandler for PanickingContacts {
        async fn save_contacts(&self, _s: &SessionContext, contacts: &[ContactUpdate]) -> Result<()> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first contact batch explodes");
            }
            assert_eq!(contacts.len(), 1);
            Ok(())
        }
    }

    /// `!hang` never returns, `!say <text>` yields then echoes the text
    struct Chatty(CommandDescriptor);

    #[async_trait]
    impl Command for Chatty {
        fn descriptor(&self) -> &CommandDescriptor {
            &self.0
        }

        async fn execute(
            &self,
            session: &SessionContext,
            _flags: &[String],
            args: &str,
            message: &MessageEnvelope,
        ) -> Result<()> {
            if self.0.name == "hang" {
                std::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            session.reply(message, MessageContent::text(args)).await
        }
    }

    fn message_router() -> (Arc<EventRouter>, SessionContext, Arc<RecordingTransport>) {
        let registry = Arc::new(CommandRegistry::new());
        registry
            .load(
                &CommandCatalog::new()
                    .with(Chatty(CommandDescriptor::new("hang", "dev")))
                    .with(Chatty(CommandDescriptor::new("say", "general"))),
            )
            .unwrap();
        let (ctx, transport) = test_context(Arc::clone(&registry));
        let router = EventRouter::new(
            Dispatcher::new(registry, "!"),
            Arc::new(LogGroupEvents),
            Arc::new(LogContacts),
            Arc::new(MemoryCredentialStore::new()),
        );
        (Arc::new(router), ctx, transport)
    }

    fn text(id: &str, chat: &str, body: &str) -> ProtocolEvent {
        ProtocolEvent::MessagesUpsert(vec![MessageEnvelope::direct(id, chat, body)])
    }

    async fn sent_count(transport: &RecordingTransport, want: usize) -> usize {
        for _ in 0..100 {
            if transport.sent().await.len() >= want {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        transport.sent().await.len()
    }

    fn router(
        groups: Arc<dyn GroupEventHandler>,
        contacts: Arc<dyn ContactHandler>,
        store: Arc<MemoryCredentialStore>,
    ) -> (Arc<EventRouter>, SessionContext) {
        let registry = Arc::new(CommandRegistry::new());
        let (ctx, _) = test_context(Arc::clone(&registry));
        let dispatcher = Dispatcher::new(registry, "!");
        (
            Arc::new(EventRouter::new(dispatcher, groups, contacts, store)),
            ctx,
        )
    }

    fn group(id: &str) -> ProtocolEvent {
        ProtocolEvent::GroupParticipantsUpdate(GroupParticipantsUpdate {
            group_id: id.to_string(),
            participants: vec!["x@s.whatsapp.net".to_string()],
            action: GroupAction::Add,
        })
    }

    #[tokio::test]
    async fn test_credentials_saved_on_route() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (router, ctx) = router(Arc::new(LogGroupEvents), Arc::new(LogContacts), store.clone());
        let creds = AuthCredentials {
            identity: Some("me@s.whatsapp.net".to_string()),
            version: 7,
            ..AuthCredentials::default()
        };
        router
            .route(&ctx, ProtocolEvent::CredentialsUpdate(creds.clone()))
            .await
            .unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.current().await, Some(creds));
    }

    #[tokio::test]
    async fn test_workers_preserve_order_within_category() {
        let groups = Arc::new(RecordingGroups::default());
        let store = Arc::new(MemoryCredentialStore::new());
        let (router, ctx) = router(groups.clone(), Arc::new(LogContacts), store);
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        for i in 0..10 {
            queues.submit(ctx.clone(), group(&format!("g{}", i))).unwrap();
        }
        drop(queues);
        tracker.close();
        tracker.wait().await;

        let seen = groups.0.lock().await.clone();
        let expected: Vec<String> = (0..10).map(|i| format!("g{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_worker_survives_handler_panic() {
        let contacts = Arc::new(PanickingContacts(AtomicUsize::new(0)));
        let store = Arc::new(MemoryCredentialStore::new());
        let (router, ctx) = router(Arc::new(LogGroupEvents), contacts.clone(), store);
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        let batch = || {
            ProtocolEvent::ContactsUpdate(vec![ContactUpdate {
                id: "a@s.whatsapp.net".to_string(),
                name: Some("A".to_string()),
                notify: None,
            }])
        };
        queues.submit(ctx.clone(), batch()).unwrap();
        queues.submit(ctx.clone(), batch()).unwrap();
        drop(queues);
        tracker.close();
        tracker.wait().await;

        assert_eq!(contacts.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_submit_returns_unqueued_events() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (router, ctx) = router(Arc::new(LogGroupEvents), Arc::new(LogContacts), store);
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        let creds = ProtocolEvent::CredentialsUpdate(AuthCredentials::empty());
        assert!(queues.submit(ctx.clone(), creds).is_err());
        let msgs = ProtocolEvent::MessagesUpsert(vec![MessageEnvelope::direct(
            "1",
            "a@s.whatsapp.net",
            "hello",
        )]);
        assert!(queues.submit(ctx, msgs).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_chat_does_not_block_other_chats() {
        let (router, ctx, transport) = message_router();
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        queues.submit(ctx.clone(), text("1", "a@s.whatsapp.net", "!hang")).unwrap();
        queues.submit(ctx.clone(), text("2", "b@s.whatsapp.net", "!say pong")).unwrap();

        assert_eq!(sent_count(&transport, 1).await, 1);
        assert_eq!(
            transport.sent().await,
            vec![("b@s.whatsapp.net".to_string(), MessageContent::text("pong"))]
        );
    }

    #[tokio::test]
    async fn test_messages_in_one_chat_keep_order() {
        let (router, ctx, transport) = message_router();
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        for i in 0..10 {
            let body = format!("!say {}", i);
            queues.submit(ctx.clone(), text(&i.to_string(), "a@s.whatsapp.net", &body)).unwrap();
            queues.submit(ctx.clone(), text(&i.to_string(), "b@s.whatsapp.net", &body)).unwrap();
        }
        drop(queues);
        tracker.close();
        tracker.wait().await;

        let sent = transport.sent().await;
        for chat in ["a@s.whatsapp.net", "b@s.whatsapp.net"] {
            let seen: Vec<MessageContent> = sent
                .iter()
                .filter(|(to, _)| to == chat)
                .map(|(_, content)| content.clone())
                .collect();
            let expected: Vec<MessageContent> =
                (0..10).map(|i| MessageContent::text(i.to_string())).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lane_is_replaced_on_next_message() {
        let (router, ctx, transport) = message_router();
        let tracker = TaskTracker::new();
        let queues = router.spawn_workers(&tracker);

        queues.submit(ctx.clone(), text("1", "a@s.whatsapp.net", "!say one")).unwrap();
        assert_eq!(sent_count(&transport, 1).await, 1);

        tokio::time::sleep(LANE_IDLE * 2).await;
        queues.submit(ctx.clone(), text("2", "a@s.whatsapp.net", "!say two")).unwrap();
        assert_eq!(sent_count(&transport, 2).await, 2);
        assert_eq!(
            transport.sent().await[1],
            ("a@s.whatsapp.net".to_string(), MessageContent::text("two"))
        );
    }
}
