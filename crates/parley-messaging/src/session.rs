//! Session Key Manager: establishes, restores, and replaces the symmetric
//! key of each conversation.
//!
//! A new session key is wrapped for both participants and the record is
//! persisted before the session id is attached to the conversation, so an
//! attached id always has its wrapped copies in the store. Attaching is a
//! conditional write; whoever loses adopts the winner's session.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parley_crypto::{unwrap_session_key, wrap_session_key, IdentityKeyPair, SessionKey};
use parley_protocol::{
    now_millis, Conversation, ConversationId, SessionId, SessionKeyRecord, UserId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SessionKeyCache;
use crate::config::MessagingConfig;
use crate::error::{MessagingError, StoreError};
use crate::identity::IdentityKeyStore;
use crate::store::ConversationStore;

/// Local view of a conversation's key establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Establishing,
    Active(SessionId),
}

pub struct SessionKeyManager {
    store: Arc<dyn ConversationStore>,
    identity: Arc<IdentityKeyStore>,
    cache: Arc<SessionKeyCache>,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    states: DashMap<ConversationId, SessionState>,
    /// (user, conversation, session) triples this device could not unwrap.
    unusable: DashSet<(UserId, ConversationId, SessionId)>,
    max_attach_retries: u32,
}

impl SessionKeyManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        identity: Arc<IdentityKeyStore>,
        cache: Arc<SessionKeyCache>,
        config: &MessagingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            cache,
            locks: DashMap::new(),
            states: DashMap::new(),
            unusable: DashSet::new(),
            max_attach_retries: config.max_attach_retries,
        }
    }

    pub fn identity(&self) -> &Arc<IdentityKeyStore> {
        &self.identity
    }

    pub fn cache(&self) -> &Arc<SessionKeyCache> {
        &self.cache
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn set_state(&self, conversation_id: &str, state: SessionState) {
        self.states.insert(conversation_id.to_string(), state);
    }

    pub fn session_state(&self, conversation_id: &str) -> SessionState {
        self.states
            .get(conversation_id)
            .map(|s| s.value().clone())
            .unwrap_or(SessionState::NoSession)
    }

    /// Cached key for `session_id`. No I/O.
    pub fn resolve(&self, session_id: &str) -> Option<SessionKey> {
        self.cache.get(session_id)
    }

    /// Make sure the conversation has a session key resident on this device
    /// and return its session id. Creates the session on first use and
    /// replaces it when this device can no longer unwrap its copy.
    pub async fn ensure_session(
        &self,
        conversation_id: &str,
        self_id: &str,
        peer_id: &str,
    ) -> Result<SessionId, MessagingError> {
        self.identity.ensure_key_pair(self_id).await?;
        let self_pair = self.identity.private_key_of(self_id)?;

        let lock = self.lock_for(conversation_id);
        let result = {
            let _guard = lock.lock().await;
            let result = self.establish(conversation_id, &self_pair, peer_id).await;
            match &result {
                Ok(session_id) => {
                    self.set_state(conversation_id, SessionState::Active(session_id.clone()))
                }
                Err(_) => {
                    // Keep a previously active session visible; only clear a
                    // half-finished establishment.
                    if self.session_state(conversation_id) == SessionState::Establishing {
                        self.set_state(conversation_id, SessionState::NoSession);
                    }
                }
            }
            result
        };

        // Drop the lock entry unless another caller is holding or waiting on it.
        drop(lock);
        self.locks
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn establish(
        &self,
        conversation_id: &str,
        self_pair: &IdentityKeyPair,
        peer_id: &str,
    ) -> Result<SessionId, MessagingError> {
        let self_id = self_pair.owner_id();
        let mut conversation = self.load_conversation(conversation_id, self_id, peer_id).await?;
        let mut lost_races = 0;

        loop {
            let prior = conversation.session_id.clone();
            if let Some(session_id) = &prior {
                if self.cache.get_in(conversation_id, session_id).is_some() {
                    debug!(conversation_id, session_id = %session_id, "session key cache hit");
                    return Ok(session_id.clone());
                }
                match self.unwrap_record(conversation_id, session_id, self_pair).await {
                    Ok(key) => {
                        self.cache.insert(conversation_id, key);
                        debug!(
                            conversation_id,
                            session_id = %session_id,
                            "restored session key from store"
                        );
                        return Ok(session_id.clone());
                    }
                    Err(e @ MessagingError::StoreUnavailable(_)) => return Err(e),
                    Err(e) => {
                        warn!(
                            conversation_id,
                            session_id = %session_id,
                            "cannot unwrap session key: {e}"
                        );
                    }
                }
            }

            if lost_races > self.max_attach_retries {
                warn!(conversation_id, lost_races, "giving up after repeated session attach conflicts");
                return Err(MessagingError::SessionRaceLost {
                    conversation_id: conversation_id.to_string(),
                    current: prior,
                });
            }

            self.set_state(conversation_id, SessionState::Establishing);
            match self
                .create_session(&conversation, self_pair, peer_id, prior.as_deref())
                .await
            {
                Ok(session_id) => return Ok(session_id),
                Err(MessagingError::SessionRaceLost { current, .. }) => {
                    lost_races += 1;
                    debug!(conversation_id, lost_races, winner = ?current, "lost session attach race, adopting winner");
                    conversation = self.load_conversation(conversation_id, self_id, peer_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_conversation(
        &self,
        conversation_id: &str,
        self_id: &str,
        peer_id: &str,
    ) -> Result<Conversation, MessagingError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| MessagingError::ConversationNotFound(conversation_id.to_string()))?;
        for user_id in [self_id, peer_id] {
            if !conversation.has_participant(user_id) || self_id == peer_id {
                return Err(MessagingError::NotAParticipant {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                });
            }
        }
        Ok(conversation)
    }

    /// Fetch the session record of `conversation_id` and unwrap the copy
    /// addressed to `self_pair`. A record that is missing, unreadable, or
    /// belongs to another conversation counts as no usable session.
    async fn unwrap_record(
        &self,
        conversation_id: &str,
        session_id: &str,
        self_pair: &IdentityKeyPair,
    ) -> Result<SessionKey, MessagingError> {
        let self_id = self_pair.owner_id();
        let unavailable = || MessagingError::KeyUnavailable(self_id.to_string());

        let record = match self.store.get_session_record(session_id).await {
            Ok(Some(record)) if record.conversation_id == conversation_id => record,
            Ok(_) => return Err(unavailable()),
            Err(e @ (StoreError::Serialization(_) | StoreError::InvalidId(_))) => {
                warn!(session_id, "unreadable session record: {e}");
                return Err(unavailable());
            }
            Err(e) => return Err(e.into()),
        };
        let wrapped = record.wrapped_for(self_id).ok_or_else(unavailable)?;
        Ok(unwrap_session_key(self_pair, session_id, wrapped)?)
    }

    async fn create_session(
        &self,
        conversation: &Conversation,
        self_pair: &IdentityKeyPair,
        peer_id: &str,
        expected_prior: Option<&str>,
    ) -> Result<SessionId, MessagingError> {
        let conversation_id = conversation.conversation_id.as_str();
        let self_id = self_pair.owner_id();
        let peer_public = self.identity.refresh_public_key(peer_id).await?;

        let session_id = Uuid::new_v4().to_string();
        let key = SessionKey::generate(session_id.clone())?;

        let mut wrapped_keys = BTreeMap::new();
        wrapped_keys.insert(
            self_id.to_string(),
            wrap_session_key(self_pair.public_key(), &key)?,
        );
        wrapped_keys.insert(peer_id.to_string(), wrap_session_key(&peer_public, &key)?);

        let record = SessionKeyRecord {
            session_id: session_id.clone(),
            conversation_id: conversation_id.to_string(),
            wrapped_keys,
            created_at: now_millis(),
        };
        self.store.put_session_record(&record).await?;
        self.store
            .attach_session_id(conversation_id, &session_id, expected_prior)
            .await?;

        self.cache.insert(conversation_id, key);
        info!(
            conversation_id,
            session_id = %session_id,
            replaced = ?expected_prior,
            "established session key"
        );
        Ok(session_id)
    }

    /// Resident key for `session_id` of `conversation_id`, unwrapping it from
    /// the store if needed. Never re-keys; used to read messages from earlier
    /// sessions. Sessions this device failed to unwrap are remembered and not
    /// fetched again.
    pub async fn load_session_key(
        &self,
        conversation_id: &str,
        session_id: &str,
        self_id: &str,
    ) -> Result<SessionKey, MessagingError> {
        if let Some(key) = self.cache.get_in(conversation_id, session_id) {
            return Ok(key);
        }
        let unusable_key = (
            self_id.to_string(),
            conversation_id.to_string(),
            session_id.to_string(),
        );
        if self.unusable.contains(&unusable_key) {
            return Err(MessagingError::KeyUnavailable(self_id.to_string()));
        }

        let self_pair = self.identity.private_key_of(self_id)?;
        match self.unwrap_record(conversation_id, session_id, &self_pair).await {
            Ok(key) => {
                self.cache.insert(conversation_id, key.clone());
                Ok(key)
            }
            Err(e @ MessagingError::StoreUnavailable(_)) => Err(e),
            Err(e) => {
                self.unusable.insert(unusable_key);
                Err(e)
            }
        }
    }
}
