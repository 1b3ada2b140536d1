// ABOUTME: Resolves prefixed chat text to registered commands and invokes them
// ABOUTME: Misses stay silent; handler errors and panics are contained per invocation

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{parse_message, CommandRegistry, ParseResult};
use crate::session::SessionContext;
use crate::traits::MessageEnvelope;

/// Receives messages that are not commands
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session: &SessionContext, message: &MessageEnvelope) -> Result<()>;
}

/// Default non-command handler: does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreMessages;

#[async_trait]
impl MessageHandler for IgnoreMessages {
    async fn handle(&self, _session: &SessionContext, _message: &MessageEnvelope) -> Result<()> {
        Ok(())
    }
}

/// Lookup of a user's accumulated experience (external persistence)
#[async_trait]
pub trait ExperienceSource: Send + Sync {
    async fn experience(&self, user_id: &str) -> Result<u64>;
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Empty body, bare prefix, or our own message
    Ignored,
    /// Not prefixed; handed to the non-command handler
    Forwarded,
    /// Prefixed but no command matched; no reply is sent
    NotFound { token: String },
    /// Sender is below the command's experience threshold
    InsufficientExperience {
        command: String,
        required: u64,
        actual: u64,
    },
    Invoked { command: String },
    /// Handler returned an error or panicked
    Failed { command: String, error: String },
}

pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    prefix: String,
    fallback: Arc<dyn MessageHandler>,
    experience: Option<Arc<dyn ExperienceSource>>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            fallback: Arc::new(IgnoreMessages),
            experience: None,
            timeout: None,
        }
    }

    pub fn with_fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = handler;
        self
    }

    pub fn with_experience(mut self, source: Arc<dyn ExperienceSource>) -> Self {
        self.experience = Some(source);
        self
    }

    /// Give up on a handler that runs longer than `limit`
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Route one inbound message. Never returns an error.
    pub async fn dispatch(
        &self,
        session: &SessionContext,
        message: &MessageEnvelope,
    ) -> DispatchOutcome {
        if message.from_me {
            return DispatchOutcome::Ignored;
        }

        let parsed = match parse_message(&message.body, &self.prefix) {
            ParseResult::Ignore => return DispatchOutcome::Ignored,
            ParseResult::Message(_) => {
                if let Err(error) = contained(self.fallback.handle(session, message), self.timeout).await {
                    tracing::error!(
                        sender = %message.sender,
                        chat = %message.from,
                        error = %error,
                        "Message handler failed"
                    );
                }
                return DispatchOutcome::Forwarded;
            }
            ParseResult::Command(parsed) => parsed,
        };

        let Some(command) = self.registry.resolve(&parsed.name) else {
            tracing::debug!(token = %parsed.name, sender = %message.sender, "No command matched");
            return DispatchOutcome::NotFound { token: parsed.name };
        };
        let desc = command.descriptor();

        if desc.min_exp > 0 {
            let actual = self.experience_of(&message.sender).await;
            if actual < desc.min_exp {
                tracing::debug!(
                    command = %desc.name,
                    sender = %message.sender,
                    required = desc.min_exp,
                    actual,
                    "Sender below experience threshold"
                );
                return DispatchOutcome::InsufficientExperience {
                    command: desc.name.clone(),
                    required: desc.min_exp,
                    actual,
                };
            }
        }

        tracing::info!(
            command = %desc.name,
            token = %parsed.name,
            sender = %message.sender,
            chat = %message.from,
            flags = parsed.flags.len(),
            "Executing command"
        );

        let invocation = command.execute(session, &parsed.flags, &parsed.raw_args, message);
        match contained(invocation, self.timeout).await {
            Ok(()) => DispatchOutcome::Invoked {
                command: desc.name.clone(),
            },
            Err(error) => {
                tracing::error!(
                    command = %desc.name,
                    sender = %message.sender,
                    error = %error,
                    "Command failed"
                );
                DispatchOutcome::Failed {
                    command: desc.name.clone(),
                    error,
                }
            }
        }
    }

    async fn experience_of(&self, user_id: &str) -> u64 {
        let Some(ref source) = self.experience else {
            return 0;
        };
        match source.experience(user_id).await {
            Ok(exp) => exp,
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "Experience lookup failed");
                0
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .field("experience", &self.experience.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Await a handler future, turning errors, panics and overruns into a message
async fn contained<F>(fut: F, limit: Option<Duration>) -> std::result::Result<(), String>
where
    F: Future<Output = Result<()>>,
{
    let guarded = AssertUnwindSafe(fut).catch_unwind();
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return Err(format!("timed out after {}ms", limit.as_millis())),
        },
        None => guarded.await,
    };
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
