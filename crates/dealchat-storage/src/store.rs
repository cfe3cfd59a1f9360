//! Async conversation store seam.
//!
//! The chat orchestrator depends on this trait rather than on SQLite, so
//! tests can substitute a store that fails on demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use dealchat_core::error::DealchatError;
use dealchat_core::types::{Conversation, Identity, Message};

use crate::repository::{ConversationRecord, ConversationRepository};

/// Durable mapping from conversation id to ordered messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(
        &self,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation, DealchatError>;

    async fn create_with_messages(
        &self,
        id: Uuid,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
        messages: &[Message],
    ) -> Result<(), DealchatError>;

    async fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<(), DealchatError>;

    async fn rename(&self, id: Uuid, title: &str) -> Result<bool, DealchatError>;

    async fn delete(&self, id: Uuid) -> Result<bool, DealchatError>;

    async fn find(&self, id: Uuid) -> Result<Option<ConversationRecord>, DealchatError>;

    async fn list_for_owner(&self, owner: &Identity) -> Result<Vec<Conversation>, DealchatError>;
}

#[async_trait]
impl ConversationStore for ConversationRepository {
    async fn create(
        &self,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Conversation, DealchatError> {
        ConversationRepository::create(self, owner, title, created_at)
    }

    async fn create_with_messages(
        &self,
        id: Uuid,
        owner: &Identity,
        title: &str,
        created_at: DateTime<Utc>,
        messages: &[Message],
    ) -> Result<(), DealchatError> {
        ConversationRepository::create_with_messages(self, id, owner, title, created_at, messages)
    }

    async fn append_messages(
        &self,
        conversation_id: Uuid,
        messages: &[Message],
    ) -> Result<(), DealchatError> {
        ConversationRepository::append_messages(self, conversation_id, messages)
    }

    async fn rename(&self, id: Uuid, title: &str) -> Result<bool, DealchatError> {
        ConversationRepository::rename(self, id, title)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DealchatError> {
        ConversationRepository::delete(self, id)
    }

    async fn find(&self, id: Uuid) -> Result<Option<ConversationRecord>, DealchatError> {
        self.find_by_id(id)
    }

    async fn list_for_owner(&self, owner: &Identity) -> Result<Vec<Conversation>, DealchatError> {
        ConversationRepository::list_for_owner(self, owner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::Database;
    use dealchat_core::types::Role;

    fn make_store() -> Arc<dyn ConversationStore> {
        Arc::new(ConversationRepository::new(Arc::new(
            Database::in_memory().unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_store_trait_object_roundtrip() {
        let store = make_store();
        let owner = Identity::new("alice");
        let id = Uuid::new_v4();
        let now = Utc::now();
        let msg = Message::new(Role::User, "hello", now);

        store
            .create_with_messages(id, &owner, "New Chat", now, std::slice::from_ref(&msg))
            .await
            .unwrap();
        assert!(store.rename(id, "hello").await.unwrap());

        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.owner, owner);
        assert_eq!(record.conversation.title, "hello");
        assert_eq!(record.conversation.messages.len(), 1);

        assert_eq!(store.list_for_owner(&owner).await.unwrap().len(), 1);
        assert!(store.delete(id).await.unwrap());
        assert!(store.find(id).await.unwrap().is_none());
    }
}
