// ABOUTME: Default external handlers wired into the event router
// ABOUTME: Keeps an in-memory contact book fed by contact updates

use anyhow::Result;
use async_trait::async_trait;
use krypton_core::{ContactHandler, ContactUpdate, Handlers, SessionContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Latest known display name per contact id
#[derive(Debug, Default)]
pub struct ContactBook {
    names: RwLock<HashMap<String, String>>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn name_of(&self, id: &str) -> Option<String> {
        self.names.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.names.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.names.read().await.is_empty()
    }
}

#[async_trait]
impl ContactHandler for ContactBook {
    async fn save_contacts(
        &self,
        _session: &SessionContext,
        contacts: &[ContactUpdate],
    ) -> Result<()> {
        let mut names = self.names.write().await;
        let mut saved = 0;
        for contact in contacts {
            // Saved name wins over the name the contact pushed
            if let Some(name) = contact.name.as_ref().or(contact.notify.as_ref()) {
                names.insert(contact.id.clone(), name.clone());
                saved += 1;
            }
        }
        tracing::debug!(received = contacts.len(), saved, "Contacts saved");
        Ok(())
    }
}

/// Router handlers for the bot binary
pub fn default_handlers(contacts: Arc<ContactBook>) -> Handlers {
    Handlers {
        contacts,
        ..Handlers::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krypton_core::testing::test_context;
    use krypton_core::CommandRegistry;

    #[tokio::test]
    async fn test_contact_book_prefers_saved_name() {
        let (ctx, _) = test_context(Arc::new(CommandRegistry::new()));
        let book = ContactBook::new();
        book.save_contacts(
            &ctx,
            &[
                ContactUpdate {
                    id: "a@s.whatsapp.net".to_string(),
                    name: Some("Alice".to_string()),
                    notify: Some("ali".to_string()),
                },
                ContactUpdate {
                    id: "b@s.whatsapp.net".to_string(),
                    name: None,
                    notify: Some("bobby".to_string()),
                },
                ContactUpdate {
                    id: "c@s.whatsapp.net".to_string(),
                    name: None,
                    notify: None,
                },
            ],
        )
        .await
        .unwrap();

        assert_eq!(book.name_of("a@s.whatsapp.net").await.as_deref(), Some("Alice"));
        assert_eq!(book.name_of("b@s.whatsapp.net").await.as_deref(), Some("bobby"));
        assert!(book.name_of("c@s.whatsapp.net").await.is_none());
        assert_eq!(book.len().await, 2);
    }
}
