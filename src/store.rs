//! Message persistence service
//!
//! The store owns nothing conversation-shaped on the client: it is called,
//! never shared. It is append-only for messages, and also keeps the
//! translation cache that the retry pipeline must purge before it retries.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    AudioRef, ConversationId, LanguagePair, Message, MessageId, Participants, Translation, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self, participants: &Participants) -> StoreResult<ConversationId>;

    async fn create_message(
        &self,
        conversation_id: &ConversationId,
        from_user: &UserId,
        translation: Translation,
        audio: Option<AudioRef>,
    ) -> StoreResult<Message>;

    async fn get_message(&self, id: &MessageId) -> StoreResult<Message>;

    /// Full history of a conversation, oldest first
    async fn messages(&self, conversation_id: &ConversationId) -> StoreResult<Vec<Message>>;

    /// Replace the stored translation of an existing message
    async fn update_translation(&self, id: &MessageId, translation: Translation) -> StoreResult<()>;

    async fn save_translation(&self, translation: Translation) -> StoreResult<()>;

    async fn cached_translation(
        &self,
        input: &str,
        pair: &LanguagePair,
    ) -> StoreResult<Option<Translation>>;

    /// Retract a cached translation; returns whether one was present
    async fn remove_translation(&self, input: &str, pair: &LanguagePair) -> StoreResult<bool>;
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<ConversationId, Participants>,
    messages: HashMap<MessageId, (ConversationId, Message)>,
    cache: HashMap<(String, LanguagePair), Translation>,
    fail_create: Option<StoreError>,
    fail_update: Option<StoreError>,
}

/// Process-local store used by tests and the offline demo
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_message` fail with `error`
    pub async fn fail_creates_with(&self, error: Option<StoreError>) {
        self.inner.write().await.fail_create = error;
    }

    /// Make every subsequent `update_translation` fail with `error`
    pub async fn fail_updates_with(&self, error: Option<StoreError>) {
        self.inner.write().await.fail_update = error;
    }

    /// Seed a message written elsewhere (e.g. by the remote participant)
    pub async fn insert_message(&self, conversation_id: &ConversationId, message: Message) {
        self.inner
            .write()
            .await
            .messages
            .insert(message.identifier.clone(), (conversation_id.clone(), message));
    }

    pub async fn cache_len(&self) -> usize {
        self.inner.read().await.cache.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_conversation(&self, participants: &Participants) -> StoreResult<ConversationId> {
        let id = ConversationId::new(Uuid::new_v4().to_string());
        self.inner
            .write()
            .await
            .conversations
            .insert(id.clone(), participants.clone());
        debug!(conversation_id = %id, "conversation created");
        Ok(id)
    }

    async fn create_message(
        &self,
        conversation_id: &ConversationId,
        from_user: &UserId,
        translation: Translation,
        audio: Option<AudioRef>,
    ) -> StoreResult<Message> {
        let mut inner = self.inner.write().await;
        if let Some(error) = &inner.fail_create {
            return Err(error.clone());
        }
        let participants = inner
            .conversations
            .get(conversation_id)
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id.as_str()))?;
        if !participants.contains(from_user) {
            return Err(StoreError::Rejected(format!(
                "{} is not a participant of {}",
                from_user, conversation_id
            )));
        }

        let message = Message {
            identifier: MessageId::new(Uuid::new_v4().to_string()),
            from_user: from_user.clone(),
            sent_date: Utc::now(),
            read_date: None,
            translation,
            is_displaying_alternate: false,
            audio_component: audio,
        };
        inner.messages.insert(
            message.identifier.clone(),
            (conversation_id.clone(), message.clone()),
        );
        Ok(message)
    }

    async fn get_message(&self, id: &MessageId) -> StoreResult<Message> {
        self.inner
            .read()
            .await
            .messages
            .get(id)
            .map(|(_, message)| message.clone())
            .ok_or_else(|| StoreError::not_found("message", id.as_str()))
    }

    async fn messages(&self, conversation_id: &ConversationId) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .messages
            .values()
            .filter(|(owner, _)| owner == conversation_id)
            .map(|(_, message)| message.clone())
            .collect();
        messages.sort_by(|a, b| {
            a.sent_date
                .cmp(&b.sent_date)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(messages)
    }

    async fn update_translation(&self, id: &MessageId, translation: Translation) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(error) = &inner.fail_update {
            return Err(error.clone());
        }
        let (_, message) = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("message", id.as_str()))?;
        message.translation = translation;
        Ok(())
    }

    async fn save_translation(&self, translation: Translation) -> StoreResult<()> {
        let key = (translation.input.clone(), translation.language_pair.clone());
        self.inner.write().await.cache.insert(key, translation);
        Ok(())
    }

    async fn cached_translation(
        &self,
        input: &str,
        pair: &LanguagePair,
    ) -> StoreResult<Option<Translation>> {
        let key = (input.to_string(), pair.clone());
        Ok(self.inner.read().await.cache.get(&key).cloned())
    }

    async fn remove_translation(&self, input: &str, pair: &LanguagePair) -> StoreResult<bool> {
        let key = (input.to_string(), pair.clone());
        Ok(self.inner.write().await.cache.remove(&key).is_some())
    }
}
