use parley_crypto::CryptoError;
use parley_protocol::{ConversationId, ProtocolError, SessionId, UserId};
use thiserror::Error;

/// Failures reported by store, directory, and device adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// Conditional attach saw a different prior session id.
    #[error("conversation {conversation_id} already has session {current:?}")]
    Conflict {
        conversation_id: ConversationId,
        current: Option<SessionId>,
    },

    #[error("invalid document id: {0:?}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("no public key published for {0}")]
    KeyNotFound(UserId),

    #[error("key material for {0} is not available on this device")]
    KeyUnavailable(UserId),

    #[error("decryption failed")]
    DecryptFailure,

    #[error("lost session race on {conversation_id} (current: {current:?})")]
    SessionRaceLost {
        conversation_id: ConversationId,
        current: Option<SessionId>,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("{user_id} is not a participant of {conversation_id}")]
    NotAParticipant {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[error("message text is empty")]
    EmptyMessage,

    #[error("a conversation needs two distinct participants")]
    InvalidParticipants,

    #[error("crypto error: {0}")]
    Crypto(CryptoError),
}

impl MessagingError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::StoreUnavailable(_) | MessagingError::SessionRaceLost { .. }
        )
    }
}

impl From<StoreError> for MessagingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConversationNotFound(id) => MessagingError::ConversationNotFound(id),
            StoreError::Conflict {
                conversation_id,
                current,
            } => MessagingError::SessionRaceLost {
                conversation_id,
                current,
            },
            other => MessagingError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<CryptoError> for MessagingError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptFailure => MessagingError::DecryptFailure,
            other => MessagingError::Crypto(other),
        }
    }
}

impl From<ProtocolError> for MessagingError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidParticipants => MessagingError::InvalidParticipants,
            other => MessagingError::Crypto(CryptoError::Encoding(other)),
        }
    }
}
