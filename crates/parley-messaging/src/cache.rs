use std::collections::HashMap;
use std::sync::RwLock;

use parley_crypto::SessionKey;
use parley_protocol::{ConversationId, SessionId};

/// Unwrapped session keys resident on this device, keyed by session id and
/// tagged with the conversation they belong to.
///
/// Owned by whoever constructs it and handed to a
/// [`SessionKeyManager`](crate::session::SessionKeyManager); managers only
/// share keys when given the same cache.
#[derive(Debug, Default)]
pub struct SessionKeyCache {
    keys: RwLock<HashMap<SessionId, (ConversationId, SessionKey)>>,
}

impl SessionKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionKey> {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        keys.get(session_id).map(|(_, key)| key.clone())
    }

    /// Key for `session_id`, only if it was cached for `conversation_id`.
    pub fn get_in(&self, conversation_id: &str, session_id: &str) -> Option<SessionKey> {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        keys.get(session_id)
            .filter(|(owner, _)| owner == conversation_id)
            .map(|(_, key)| key.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        let keys = self.keys.read().unwrap_or_else(|p| p.into_inner());
        keys.contains_key(session_id)
    }

    pub fn insert(&self, conversation_id: &str, key: SessionKey) {
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        keys.insert(
            key.session_id().to_string(),
            (conversation_id.to_string(), key),
        );
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionKey> {
        let mut keys = self.keys.write().unwrap_or_else(|p| p.into_inner());
        keys.remove(session_id).map(|(_, key)| key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every resident key (sign-out).
    pub fn clear(&self) {
        self.keys.write().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
