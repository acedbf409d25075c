use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::codec::base64_bytes;
use crate::error::ProtocolError;

/// Stable identifier of a user identity (the shared directory key).
pub type UserId = String;

/// Identifier of a two-party conversation document.
pub type ConversationId = String;

/// Identifier of a session key record.
pub type SessionId = String;

/// Identifier of a single message record.
pub type MessageId = String;

/// Unix time in milliseconds.
pub type Timestamp = u64;

/// Preview shown in conversation lists for encrypted messages.
/// The shared store never sees message text, so the preview is a fixed label.
pub const ENCRYPTED_PREVIEW: &str = "Encrypted message";

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A two-party conversation as stored in the shared document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub participant_ids: [UserId; 2],
    /// Attached on first key establishment; replaced only by a re-key.
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub last_message_preview: String,
    #[serde(default)]
    pub last_message_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Conversation {
    /// Build a fresh conversation record with no session attached.
    pub fn new(
        conversation_id: ConversationId,
        participant_ids: [UserId; 2],
    ) -> Result<Self, ProtocolError> {
        if participant_ids[0] == participant_ids[1] || participant_ids.iter().any(String::is_empty)
        {
            return Err(ProtocolError::InvalidParticipants);
        }
        Ok(Self {
            conversation_id,
            participant_ids,
            session_id: None,
            last_message_preview: String::new(),
            last_message_at: None,
            created_at: now_millis(),
        })
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }

    /// The participant that is not `user_id`, if `user_id` takes part at all.
    pub fn peer_of(&self, user_id: &str) -> Option<&UserId> {
        match &self.participant_ids {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// A session key wrapped under one participant's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(#[serde(with = "base64_bytes")] pub Vec<u8>);

/// Persisted form of a conversation's symmetric session key.
///
/// Holds one wrapped copy per participant; the raw key never appears here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyRecord {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub wrapped_keys: BTreeMap<UserId, WrappedKey>,
    pub created_at: Timestamp,
}

impl SessionKeyRecord {
    pub fn wrapped_for(&self, user_id: &str) -> Option<&WrappedKey> {
        self.wrapped_keys.get(user_id)
    }

    /// True when every given participant has a wrapped copy.
    pub fn covers(&self, participants: &[UserId]) -> bool {
        participants.iter().all(|p| self.wrapped_keys.contains_key(p))
    }
}

/// Ciphertext and IV stored in place of message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session whose key produced this ciphertext.
    pub session_id: SessionId,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

/// Message payload: an envelope, or plaintext as a degraded fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Encrypted { envelope: Envelope },
    Plaintext { text: String },
}

/// A message record in a conversation's append-only collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub created_at: Timestamp,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    pub fn encrypted(&self) -> bool {
        matches!(self.body, MessageBody::Encrypted { .. })
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.body {
            MessageBody::Encrypted { envelope } => Some(envelope),
            MessageBody::Plaintext { .. } => None,
        }
    }

    /// Conversation-list preview. Never reveals encrypted content.
    pub fn preview(&self, max_chars: usize) -> String {
        match &self.body {
            MessageBody::Encrypted { .. } => ENCRYPTED_PREVIEW.to_string(),
            MessageBody::Plaintext { text } => text.chars().take(max_chars).collect(),
        }
    }
}

/// A message as handed to the UI after decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: Timestamp,
    pub encrypted: bool,
    /// Set when the text is a placeholder for content that could not be decrypted.
    #[serde(default)]
    pub unavailable: bool,
}
