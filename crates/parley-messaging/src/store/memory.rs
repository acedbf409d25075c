//! In-process adapters. Used by tests and by embedders that supply their own
//! persistence behind a cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_protocol::{
    Conversation, ConversationId, Message, SessionId, SessionKeyRecord, UserId,
};
use tokio::sync::mpsc;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{apply_read, broadcast, ConversationStore, DeviceKeyStore, KeyDirectory, MessageStream};
use crate::error::StoreError;

#[derive(Default)]
struct SharedState {
    conversations: HashMap<ConversationId, Conversation>,
    sessions: HashMap<SessionId, SessionKeyRecord>,
    messages: HashMap<ConversationId, Vec<Message>>,
    subscribers: HashMap<ConversationId, Vec<mpsc::UnboundedSender<Vec<Message>>>>,
    public_keys: HashMap<UserId, String>,
}

/// Shared document store and key directory held in memory.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], to exercise outage handling.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<SharedState>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, SharedState>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(self.state.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Number of messages stored for a conversation.
    pub fn message_count(&self, conversation_id: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.messages.get(conversation_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state()?.conversations.get(conversation_id).cloned())
    }

    async fn create_conversation(
        &self,
        participants: [UserId; 2],
    ) -> Result<ConversationId, StoreError> {
        let conversation = Conversation::new(Uuid::new_v4().to_string(), participants)?;
        let id = conversation.conversation_id.clone();
        self.state()?.conversations.insert(id.clone(), conversation);
        Ok(id)
    }

    async fn attach_session_id(
        &self,
        conversation_id: &str,
        session_id: &str,
        expected_prior: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let conversation = state
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.to_string()))?;
        if conversation.session_id.as_deref() != expected_prior {
            return Err(StoreError::Conflict {
                conversation_id: conversation_id.to_string(),
                current: conversation.session_id.clone(),
            });
        }
        conversation.session_id = Some(session_id.to_string());
        Ok(())
    }

    async fn put_session_record(&self, record: &SessionKeyRecord) -> Result<(), StoreError> {
        self.state()?
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionKeyRecord>, StoreError> {
        Ok(self.state()?.sessions.get(session_id).cloned())
    }

    async fn append_message(&self, message: Message, preview: String) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let conversation_id = message.conversation_id.clone();
        let conversation = state
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(conversation_id.clone()))?;
        conversation.last_message_preview = preview;
        conversation.last_message_at = Some(message.created_at);

        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        if let Some(subscribers) = state.subscribers.get_mut(&conversation_id) {
            broadcast(subscribers, &[message]);
        }
        Ok(())
    }

    async fn subscribe_messages(&self, conversation_id: &str) -> Result<MessageStream, StoreError> {
        let mut state = self.state()?;
        if !state.conversations.contains_key(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }
        let history = state
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, so the initial send cannot fail.
        let _ = tx.send(history);
        state
            .subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<(), StoreError> {
        let mut state = self.state()?;
        let SharedState {
            messages,
            subscribers,
            ..
        } = &mut *state;
        let Some(messages) = messages.get_mut(conversation_id) else {
            return Ok(());
        };
        let changed = apply_read(messages, reader_id);
        if let Some(subscribers) = subscribers.get_mut(conversation_id) {
            broadcast(subscribers, &changed);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for MemoryStore {
    async fn publish_public_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError> {
        self.state()?
            .public_keys
            .insert(owner_id.to_string(), exported.to_string());
        Ok(())
    }

    async fn fetch_public_key(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state()?.public_keys.get(owner_id).cloned())
    }
}

/// Device key store held in memory.
#[derive(Default)]
pub struct MemoryDeviceKeys {
    keys: Mutex<HashMap<UserId, Zeroizing<String>>>,
}

impl MemoryDeviceKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceKeyStore for MemoryDeviceKeys {
    async fn save_private_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.insert(owner_id.to_string(), Zeroizing::new(exported.to_string()));
        Ok(())
    }

    async fn load_private_key(
        &self,
        owner_id: &str,
    ) -> Result<Option<Zeroizing<String>>, StoreError> {
        let keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        Ok(keys.get(owner_id).cloned())
    }

    async fn delete_private_key(&self, owner_id: &str) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.remove(owner_id);
        Ok(())
    }
}
