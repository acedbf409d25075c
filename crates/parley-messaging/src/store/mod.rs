//! Contracts for the shared document store, the public key directory, and
//! the local device key store, plus in-memory and filesystem adapters.
//!
//! The shared store and the key directory are visible to every participant.
//! The device store is local to one device and is the only place a private
//! key is ever written.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use parley_protocol::{Conversation, ConversationId, Message, SessionKeyRecord, UserId};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::error::StoreError;

/// Receiving half of a message subscription.
///
/// The first batch is the existing history in append order. Later batches
/// carry newly appended messages and messages whose `read_by` changed.
/// Dropping the receiver unsubscribes.
pub type MessageStream = mpsc::UnboundedReceiver<Vec<Message>>;

/// Conversation, session record, and message persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Create a conversation between two participants and return its id.
    async fn create_conversation(
        &self,
        participants: [UserId; 2],
    ) -> Result<ConversationId, StoreError>;

    /// Set the conversation's session id only if it currently equals
    /// `expected_prior`. Otherwise fails with [`StoreError::Conflict`]
    /// carrying the current value.
    async fn attach_session_id(
        &self,
        conversation_id: &str,
        session_id: &str,
        expected_prior: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn put_session_record(&self, record: &SessionKeyRecord) -> Result<(), StoreError>;

    async fn get_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionKeyRecord>, StoreError>;

    /// Append a message and update the conversation's preview fields.
    async fn append_message(&self, message: Message, preview: String) -> Result<(), StoreError>;

    async fn subscribe_messages(&self, conversation_id: &str) -> Result<MessageStream, StoreError>;

    /// Add `reader_id` to `read_by` of every message not sent by them.
    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<(), StoreError>;
}

/// Shared directory of published public keys, in exported (base64) form.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn publish_public_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError>;

    async fn fetch_public_key(&self, owner_id: &str) -> Result<Option<String>, StoreError>;
}

/// Device-local private key storage, in exported (base64) form.
#[async_trait]
pub trait DeviceKeyStore: Send + Sync {
    async fn save_private_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError>;

    async fn load_private_key(&self, owner_id: &str)
        -> Result<Option<Zeroizing<String>>, StoreError>;

    async fn delete_private_key(&self, owner_id: &str) -> Result<(), StoreError>;
}

/// Push `batch` to every live subscriber, dropping closed ones.
pub(crate) fn broadcast(subscribers: &mut Vec<mpsc::UnboundedSender<Vec<Message>>>, batch: &[Message]) {
    if batch.is_empty() {
        return;
    }
    subscribers.retain(|tx| tx.send(batch.to_vec()).is_ok());
}

/// Messages in `messages` not sent by `reader_id` and not yet read by them
/// get `reader_id` added. Returns the changed messages.
pub(crate) fn apply_read(messages: &mut [Message], reader_id: &str) -> Vec<Message> {
    messages
        .iter_mut()
        .filter(|m| m.sender_id != reader_id)
        .filter_map(|m| m.read_by.insert(reader_id.to_string()).then(|| m.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use parley_protocol::MessageBody;

    use super::*;

    fn message(id: &str, sender: &str) -> Message {
        Message {
            message_id: id.into(),
            conversation_id: "c1".into(),
            sender_id: sender.into(),
            body: MessageBody::Plaintext { text: "hi".into() },
            created_at: 0,
            read_by: BTreeSet::new(),
        }
    }

    #[test]
    fn apply_read_skips_own_and_already_read() {
        let mut messages = vec![message("m1", "alice"), message("m2", "bob"), message("m3", "bob")];
        messages[2].read_by.insert("alice".into());

        let changed = apply_read(&mut messages, "alice");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].message_id, "m2");
        assert!(messages[0].read_by.is_empty());
        assert!(messages[1].read_by.contains("alice"));
    }

    #[test]
    fn broadcast_drops_closed_subscribers() {
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        drop(rx2);
        let mut subscribers = vec![tx1, tx2];

        broadcast(&mut subscribers, &[message("m1", "alice")]);
        assert_eq!(subscribers.len(), 1);
        assert_eq!(rx1.try_recv().unwrap().len(), 1);
    }
}
