//! Filesystem adapters: JSON documents under a shared directory, private
//! keys under a device directory.
//!
//! Read-modify-write sequences are serialized by an in-process lock, so the
//! conditional session attach is only atomic among users of the same
//! `FsStore` value. Live subscriptions see writes made through that value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use parley_crypto::persistence::{self, DEFAULT_PBKDF2_ITERATIONS};
use parley_crypto::IdentityKeyPair;
use parley_protocol::codec::{decode_document, encode_document};
use parley_protocol::{Conversation, ConversationId, Message, SessionKeyRecord, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{apply_read, broadcast, ConversationStore, DeviceKeyStore, KeyDirectory, MessageStream};
use crate::error::StoreError;

const CONVERSATIONS_DIR: &str = "conversations";
const SESSIONS_DIR: &str = "sessions";
const MESSAGES_DIR: &str = "messages";
const PUBLIC_KEYS_DIR: &str = "keys";

/// Ids become file names, so only a conservative character set is allowed.
fn checked_id(id: &str) -> Result<&str, StoreError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(id)
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match read_optional(path).await? {
        Some(bytes) => Ok(Some(decode_document(&bytes)?)),
        None => Ok(None),
    }
}

async fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), StoreError> {
    write_atomic(path, &encode_document(doc)?).await
}

/// Shared document store and key directory rooted at a directory.
pub struct FsStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<HashMap<ConversationId, Vec<mpsc::UnboundedSender<Vec<Message>>>>>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, dir: &str, id: &str, ext: &str) -> Result<PathBuf, StoreError> {
        Ok(self.root.join(dir).join(format!("{}.{ext}", checked_id(id)?)))
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.doc_path(CONVERSATIONS_DIR, id, "json")
    }

    fn messages_path(&self, conversation_id: &str) -> Result<PathBuf, StoreError> {
        self.doc_path(MESSAGES_DIR, conversation_id, "json")
    }

    async fn load_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        read_document(&self.conversation_path(id)?)
            .await?
            .ok_or_else(|| StoreError::ConversationNotFound(id.to_string()))
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(read_document(&self.messages_path(conversation_id)?)
            .await?
            .unwrap_or_default())
    }

    fn notify(&self, conversation_id: &str, batch: &[Message]) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(list) = subscribers.get_mut(conversation_id) {
            broadcast(list, batch);
        }
    }
}

#[async_trait]
impl ConversationStore for FsStore {
    async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        read_document(&self.conversation_path(conversation_id)?).await
    }

    async fn create_conversation(
        &self,
        participants: [UserId; 2],
    ) -> Result<ConversationId, StoreError> {
        for participant in &participants {
            checked_id(participant)?;
        }
        let conversation = Conversation::new(Uuid::new_v4().to_string(), participants)?;
        let _guard = self.write_lock.lock().await;
        write_document(
            &self.conversation_path(&conversation.conversation_id)?,
            &conversation,
        )
        .await?;
        debug!(conversation_id = %conversation.conversation_id, "conversation document written");
        Ok(conversation.conversation_id)
    }

    async fn attach_session_id(
        &self,
        conversation_id: &str,
        session_id: &str,
        expected_prior: Option<&str>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut conversation = self.load_conversation(conversation_id).await?;
        if conversation.session_id.as_deref() != expected_prior {
            return Err(StoreError::Conflict {
                conversation_id: conversation_id.to_string(),
                current: conversation.session_id,
            });
        }
        conversation.session_id = Some(session_id.to_string());
        write_document(&self.conversation_path(conversation_id)?, &conversation).await
    }

    async fn put_session_record(&self, record: &SessionKeyRecord) -> Result<(), StoreError> {
        let path = self.doc_path(SESSIONS_DIR, &record.session_id, "json")?;
        write_document(&path, record).await
    }

    async fn get_session_record(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionKeyRecord>, StoreError> {
        read_document(&self.doc_path(SESSIONS_DIR, session_id, "json")?).await
    }

    async fn append_message(&self, message: Message, preview: String) -> Result<(), StoreError> {
        let conversation_id = message.conversation_id.clone();
        let _guard = self.write_lock.lock().await;

        let mut conversation = self.load_conversation(&conversation_id).await?;
        let mut messages = self.load_messages(&conversation_id).await?;
        messages.push(message.clone());
        write_document(&self.messages_path(&conversation_id)?, &messages).await?;

        conversation.last_message_preview = preview;
        conversation.last_message_at = Some(message.created_at);
        write_document(&self.conversation_path(&conversation_id)?, &conversation).await?;

        self.notify(&conversation_id, &[message]);
        Ok(())
    }

    async fn subscribe_messages(&self, conversation_id: &str) -> Result<MessageStream, StoreError> {
        // Held so no append lands between the snapshot and registration.
        let _guard = self.write_lock.lock().await;
        self.load_conversation(conversation_id).await?;
        let history = self.load_messages(conversation_id).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(history);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut messages = self.load_messages(conversation_id).await?;
        let changed = apply_read(&mut messages, reader_id);
        if changed.is_empty() {
            return Ok(());
        }
        write_document(&self.messages_path(conversation_id)?, &messages).await?;
        self.notify(conversation_id, &changed);
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for FsStore {
    async fn publish_public_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError> {
        let path = self.doc_path(PUBLIC_KEYS_DIR, owner_id, "pub")?;
        write_atomic(&path, exported.as_bytes()).await
    }

    async fn fetch_public_key(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        let path = self.doc_path(PUBLIC_KEYS_DIR, owner_id, "pub")?;
        Ok(read_optional(&path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()))
    }
}

/// Private keys stored one file per owner under a device directory.
///
/// With a passphrase, files are sealed (PBKDF2 + AES-256-GCM); without one
/// they hold the exported base64 key. Sealed files are recognised by their
/// header on load, whichever mode the store is in.
pub struct FsDeviceKeyStore {
    dir: PathBuf,
    passphrase: Option<Zeroizing<String>>,
    iterations: u32,
}

impl FsDeviceKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            passphrase: None,
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    /// Override the PBKDF2 work factor used when sealing.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    fn key_path(&self, owner_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self.dir.join(format!("{}.key", checked_id(owner_id)?)))
    }
}

#[async_trait]
impl DeviceKeyStore for FsDeviceKeyStore {
    async fn save_private_key(&self, owner_id: &str, exported: &str) -> Result<(), StoreError> {
        let path = self.key_path(owner_id)?;
        let data = match &self.passphrase {
            Some(passphrase) => {
                let pair = IdentityKeyPair::from_exported_private(owner_id, exported)
                    .map_err(|e| StoreError::Unavailable(format!("invalid private key: {e}")))?;
                persistence::seal_private_key_with_iterations(&pair, passphrase, self.iterations)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?
            }
            None => exported.as_bytes().to_vec(),
        };
        write_atomic(&path, &data).await
    }

    async fn load_private_key(
        &self,
        owner_id: &str,
    ) -> Result<Option<Zeroizing<String>>, StoreError> {
        let Some(data) = read_optional(&self.key_path(owner_id)?).await? else {
            return Ok(None);
        };
        let data = Zeroizing::new(data);

        if persistence::has_valid_header(&data) {
            let passphrase = self.passphrase.as_ref().ok_or_else(|| {
                StoreError::Unavailable(format!("key file for {owner_id} is sealed; passphrase required"))
            })?;
            let pair = persistence::open_private_key(&data, owner_id, passphrase)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            return Ok(Some(pair.export_private()));
        }

        Ok(Some(Zeroizing::new(
            String::from_utf8_lossy(&data).trim().to_string(),
        )))
    }

    async fn delete_private_key(&self, owner_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.key_path(owner_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use parley_protocol::{now_millis, MessageBody};

    use super::*;

    const FAST: u32 = 1_000;

    fn message(conversation_id: &str, sender: &str) -> Message {
        Message {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender.into(),
            body: MessageBody::Plaintext { text: "hi".into() },
            created_at: now_millis(),
            read_by: BTreeSet::new(),
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(checked_id("alice").is_ok());
        assert!(checked_id("a1b2-c3@example.org").is_ok());
        assert!(checked_id("../etc/passwd").is_err());
        assert!(checked_id(".hidden").is_err());
        assert!(checked_id("").is_err());
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FsStore::new(dir.path());
            let id = store
                .create_conversation(["alice".into(), "bob".into()])
                .await
                .unwrap();
            store.attach_session_id(&id, "s1", None).await.unwrap();
            store
                .append_message(message(&id, "alice"), "Encrypted message".into())
                .await
                .unwrap();
            id
        };

        let store = FsStore::new(dir.path());
        let conv = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(conv.session_id.as_deref(), Some("s1"));
        assert_eq!(conv.last_message_preview, "Encrypted message");

        let mut rx = store.subscribe_messages(&id).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attach_conflict_reports_current() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let id = store
            .create_conversation(["alice".into(), "bob".into()])
            .await
            .unwrap();
        store.attach_session_id(&id, "s1", None).await.unwrap();
        let err = store.attach_session_id(&id, "s2", None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { current: Some(ref s), .. } if s == "s1"));
    }

    #[tokio::test]
    async fn missing_conversation_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let result = store.append_message(message("nope", "alice"), String::new()).await;
        assert!(matches!(result, Err(StoreError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn public_keys_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.fetch_public_key("alice").await.unwrap().is_none());
        store.publish_public_key("alice", "AAAA").await.unwrap();
        assert_eq!(store.fetch_public_key("alice").await.unwrap().as_deref(), Some("AAAA"));
    }

    #[tokio::test]
    async fn sealed_device_key_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let pair = IdentityKeyPair::generate("alice");
        let device = FsDeviceKeyStore::new(dir.path())
            .with_passphrase("correct horse")
            .with_iterations(FAST);
        device.save_private_key("alice", &pair.export_private()).await.unwrap();

        let raw = std::fs::read(dir.path().join("alice.key")).unwrap();
        assert!(persistence::has_valid_header(&raw));

        let loaded = device.load_private_key("alice").await.unwrap().unwrap();
        assert_eq!(loaded.as_str(), pair.export_private().as_str());
    }

    #[tokio::test]
    async fn sealed_device_key_needs_right_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let pair = IdentityKeyPair::generate("alice");
        FsDeviceKeyStore::new(dir.path())
            .with_passphrase("correct horse")
            .with_iterations(FAST)
            .save_private_key("alice", &pair.export_private())
            .await
            .unwrap();

        let wrong = FsDeviceKeyStore::new(dir.path()).with_passphrase("battery staple");
        assert!(matches!(
            wrong.load_private_key("alice").await,
            Err(StoreError::Unavailable(_))
        ));
        let none = FsDeviceKeyStore::new(dir.path());
        assert!(none.load_private_key("alice").await.is_err());
    }

    #[tokio::test]
    async fn plain_device_key_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let device = FsDeviceKeyStore::new(dir.path());
        device.save_private_key("bob", "c2VjcmV0").await.unwrap();
        assert_eq!(
            device.load_private_key("bob").await.unwrap().unwrap().as_str(),
            "c2VjcmV0"
        );
        device.delete_private_key("bob").await.unwrap();
        device.delete_private_key("bob").await.unwrap();
        assert!(device.load_private_key("bob").await.unwrap().is_none());
    }
}
