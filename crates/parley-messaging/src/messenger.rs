//! UI-facing messaging surface: create conversations, send, follow a
//! decrypted feed, mark read.

use std::sync::Arc;

use parley_crypto::{decrypt_envelope, encrypt};
use parley_protocol::{
    now_millis, ConversationId, DecryptedMessage, Message, MessageBody, UserId,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::SessionKeyCache;
use crate::config::MessagingConfig;
use crate::error::MessagingError;
use crate::identity::IdentityKeyStore;
use crate::session::SessionKeyManager;
use crate::store::{ConversationStore, DeviceKeyStore, KeyDirectory};

pub struct Messenger {
    store: Arc<dyn ConversationStore>,
    sessions: Arc<SessionKeyManager>,
    config: MessagingConfig,
}

/// A running decrypting subscription. Dropping or closing it stops delivery.
pub struct FeedHandle {
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn close(self) {}

    /// True once the subscription has ended (store side closed or aborted).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Messenger {
    /// Wire a messenger with its own identity store and key cache.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn KeyDirectory>,
        device: Arc<dyn DeviceKeyStore>,
        config: MessagingConfig,
    ) -> Self {
        let identity = Arc::new(IdentityKeyStore::new(directory, device));
        let sessions = Arc::new(SessionKeyManager::new(
            store.clone(),
            identity,
            Arc::new(SessionKeyCache::new()),
            &config,
        ));
        Self::with_sessions(store, sessions, config)
    }

    pub fn with_sessions(
        store: Arc<dyn ConversationStore>,
        sessions: Arc<SessionKeyManager>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionKeyManager> {
        &self.sessions
    }

    pub fn identity(&self) -> &Arc<IdentityKeyStore> {
        self.sessions.identity()
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub async fn create_conversation(
        &self,
        self_id: &str,
        peer_id: &str,
    ) -> Result<ConversationId, MessagingError> {
        if self_id == peer_id || self_id.is_empty() || peer_id.is_empty() {
            return Err(MessagingError::InvalidParticipants);
        }
        self.identity().ensure_key_pair(self_id).await?;
        let id = self
            .store
            .create_conversation([self_id.to_string(), peer_id.to_string()])
            .await?;
        debug!(conversation_id = %id, self_id, peer_id, "created conversation");
        Ok(id)
    }

    /// Encrypt `plaintext` under the conversation's session and append it.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        self_id: &str,
        peer_id: &str,
        plaintext: &str,
    ) -> Result<Message, MessagingError> {
        if plaintext.trim().is_empty() {
            return Err(MessagingError::EmptyMessage);
        }

        let body = match self.encrypt_for(conversation_id, self_id, peer_id, plaintext).await {
            Ok(body) => body,
            Err(
                e @ (MessagingError::KeyNotFound(_)
                | MessagingError::StoreUnavailable(_)
                | MessagingError::ConversationNotFound(_)
                | MessagingError::NotAParticipant { .. }),
            ) => return Err(e),
            Err(e) if self.config.allow_plaintext_fallback => {
                warn!(conversation_id, "sending unencrypted, session setup failed: {e}");
                MessageBody::Plaintext {
                    text: plaintext.to_string(),
                }
            }
            Err(e) => return Err(e),
        };

        let message = Message {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: self_id.to_string(),
            body,
            created_at: now_millis(),
            read_by: Default::default(),
        };
        let preview = message.preview(self.config.preview_max_chars);
        self.store.append_message(message.clone(), preview).await?;
        debug!(conversation_id, message_id = %message.message_id, encrypted = message.encrypted(), "message sent");
        Ok(message)
    }

    async fn encrypt_for(
        &self,
        conversation_id: &str,
        self_id: &str,
        peer_id: &str,
        plaintext: &str,
    ) -> Result<MessageBody, MessagingError> {
        let session_id = self
            .sessions
            .ensure_session(conversation_id, self_id, peer_id)
            .await?;
        let key = self
            .sessions
            .resolve(&session_id)
            .ok_or_else(|| MessagingError::KeyUnavailable(self_id.to_string()))?;
        let envelope = encrypt(plaintext, &key)?;
        Ok(MessageBody::Encrypted { envelope })
    }

    /// Decrypt one stored message for `self_id`. Never fails: content that
    /// cannot be decrypted comes back as the placeholder.
    pub async fn decrypt_message(&self, message: &Message, self_id: &str) -> DecryptedMessage {
        decrypt_for(
            &self.sessions,
            message,
            self_id,
            &self.config.unavailable_placeholder,
        )
        .await
    }

    /// Subscribe to a conversation and deliver decrypted batches to
    /// `callback`. The first batch is the existing history.
    ///
    /// Opening the feed establishes (or repairs) the session first, so a
    /// device that lost its key re-keys here instead of on its next send.
    pub async fn on_messages<F>(
        &self,
        conversation_id: &str,
        self_id: &str,
        mut callback: F,
    ) -> Result<FeedHandle, MessagingError>
    where
        F: FnMut(Vec<DecryptedMessage>) + Send + 'static,
    {
        let peer_id = self.peer_of(conversation_id, self_id).await?;
        match self.sessions.ensure_session(conversation_id, self_id, &peer_id).await {
            Ok(_) => {}
            Err(e @ MessagingError::StoreUnavailable(_)) => return Err(e),
            Err(e) => {
                // Still readable: history may name sessions this device holds.
                warn!(conversation_id, "opening feed without an active session: {e}");
                self.identity().ensure_key_pair(self_id).await?;
            }
        }

        let mut stream = self.store.subscribe_messages(conversation_id).await?;
        let sessions = self.sessions.clone();
        let self_id: UserId = self_id.to_string();
        let placeholder = self.config.unavailable_placeholder.clone();
        let conversation_id = conversation_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(batch) = stream.recv().await {
                let mut decrypted = Vec::with_capacity(batch.len());
                for message in &batch {
                    decrypted.push(decrypt_for(&sessions, message, &self_id, &placeholder).await);
                }
                callback(decrypted);
            }
            debug!(conversation_id, "message feed ended");
        });
        Ok(FeedHandle { task })
    }

    /// Current history, decrypted. One-shot form of [`on_messages`](Self::on_messages).
    pub async fn history(
        &self,
        conversation_id: &str,
        self_id: &str,
    ) -> Result<Vec<DecryptedMessage>, MessagingError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let feed = self
            .on_messages(conversation_id, self_id, move |batch| {
                let _ = tx.send(batch);
            })
            .await?;
        let first = rx.recv().await.unwrap_or_default();
        feed.close();
        Ok(first)
    }

    pub async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        self_id: &str,
    ) -> Result<(), MessagingError> {
        self.peer_of(conversation_id, self_id).await?;
        self.store.mark_read(conversation_id, self_id).await?;
        Ok(())
    }

    /// The other participant of a conversation `self_id` takes part in.
    pub async fn peer_of(
        &self,
        conversation_id: &str,
        self_id: &str,
    ) -> Result<UserId, MessagingError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| MessagingError::ConversationNotFound(conversation_id.to_string()))?;
        conversation
            .peer_of(self_id)
            .cloned()
            .ok_or_else(|| MessagingError::NotAParticipant {
                conversation_id: conversation_id.to_string(),
                user_id: self_id.to_string(),
            })
    }
}

async fn decrypt_for(
    sessions: &SessionKeyManager,
    message: &Message,
    self_id: &str,
    placeholder: &str,
) -> DecryptedMessage {
    let (text, unavailable) = match &message.body {
        MessageBody::Plaintext { text } => (text.clone(), false),
        MessageBody::Encrypted { envelope } => {
            let result = match sessions
                .load_session_key(&message.conversation_id, &envelope.session_id, self_id)
                .await
            {
                Ok(key) => decrypt_envelope(envelope, &key).map_err(MessagingError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(text) => (text, false),
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        session_id = %envelope.session_id,
                        "failed to decrypt message: {e}"
                    );
                    (placeholder.to_string(), true)
                }
            }
        }
    };

    DecryptedMessage {
        id: message.message_id.clone(),
        sender_id: message.sender_id.clone(),
        text,
        created_at: message.created_at,
        encrypted: message.encrypted(),
        unavailable,
    }
}
