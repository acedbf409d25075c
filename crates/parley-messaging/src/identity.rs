//! Identity Key Store: one long-term key pair per user.
//!
//! The public half lives in the shared [`KeyDirectory`]; the private half
//! only in the [`DeviceKeyStore`]. Both are cached in memory once loaded.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use parley_crypto::{import_public_key, IdentityKeyPair, PublicKey};
use parley_protocol::UserId;
use tracing::{debug, info, warn};

use crate::error::MessagingError;
use crate::store::{DeviceKeyStore, KeyDirectory};

pub struct IdentityKeyStore {
    directory: Arc<dyn KeyDirectory>,
    device: Arc<dyn DeviceKeyStore>,
    public_keys: RwLock<HashMap<UserId, PublicKey>>,
    key_pairs: RwLock<HashMap<UserId, IdentityKeyPair>>,
    /// Serializes first-time setup so two callers never generate competing pairs.
    setup_lock: tokio::sync::Mutex<()>,
}

impl IdentityKeyStore {
    pub fn new(directory: Arc<dyn KeyDirectory>, device: Arc<dyn DeviceKeyStore>) -> Self {
        Self {
            directory,
            device,
            public_keys: RwLock::new(HashMap::new()),
            key_pairs: RwLock::new(HashMap::new()),
            setup_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached_pair(&self, owner_id: &str) -> Option<IdentityKeyPair> {
        let pairs = self.key_pairs.read().unwrap_or_else(|p| p.into_inner());
        pairs.get(owner_id).cloned()
    }

    fn cache_pair(&self, pair: IdentityKeyPair) {
        let owner_id = pair.owner_id().to_string();
        self.public_keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(owner_id.clone(), *pair.public_key());
        self.key_pairs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(owner_id, pair);
    }

    /// Make sure `owner_id` has a usable key pair on this device and a
    /// matching published public key. Returns the public key.
    pub async fn ensure_key_pair(&self, owner_id: &str) -> Result<PublicKey, MessagingError> {
        if let Some(pair) = self.cached_pair(owner_id) {
            return Ok(*pair.public_key());
        }
        let _guard = self.setup_lock.lock().await;
        if let Some(pair) = self.cached_pair(owner_id) {
            return Ok(*pair.public_key());
        }

        let published = match self.directory.fetch_public_key(owner_id).await? {
            Some(exported) => match import_public_key(&exported) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(owner_id, "published public key is malformed: {e}");
                    None
                }
            },
            None => None,
        };

        let local = match self.device.load_private_key(owner_id).await? {
            Some(exported) => match IdentityKeyPair::from_exported_private(owner_id, &exported) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    warn!(owner_id, "stored private key is unreadable: {e}");
                    None
                }
            },
            None => None,
        };

        let pair = match (published, local) {
            (Some(published), Some(pair)) if pair.matches_public(&published) => {
                debug!(owner_id, "loaded identity key pair from device");
                pair
            }
            (Some(_), _) => {
                warn!(
                    owner_id,
                    "identity reset: local private key missing or does not match the published key"
                );
                self.generate_and_store(owner_id).await?
            }
            (None, Some(pair)) => {
                info!(owner_id, "republishing public key for existing device key");
                self.directory
                    .publish_public_key(owner_id, &pair.export_public())
                    .await?;
                pair
            }
            (None, None) => {
                info!(owner_id, "generating identity key pair");
                self.generate_and_store(owner_id).await?
            }
        };

        let public = *pair.public_key();
        self.cache_pair(pair);
        Ok(public)
    }

    /// Private half is saved before the public half is published, so a
    /// crash in between leaves a key that the next call republishes.
    async fn generate_and_store(&self, owner_id: &str) -> Result<IdentityKeyPair, MessagingError> {
        let pair = IdentityKeyPair::generate(owner_id);
        self.device
            .save_private_key(owner_id, &pair.export_private())
            .await?;
        self.directory
            .publish_public_key(owner_id, &pair.export_public())
            .await?;
        Ok(pair)
    }

    /// Public key of `owner_id`, from cache or the directory.
    pub async fn public_key_of(&self, owner_id: &str) -> Result<PublicKey, MessagingError> {
        let cached = self
            .public_keys
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(owner_id)
            .copied();
        match cached {
            Some(key) => Ok(key),
            None => self.refresh_public_key(owner_id).await,
        }
    }

    /// Fetch `owner_id`'s public key from the directory, bypassing the cache.
    pub async fn refresh_public_key(&self, owner_id: &str) -> Result<PublicKey, MessagingError> {
        let exported = self
            .directory
            .fetch_public_key(owner_id)
            .await?
            .ok_or_else(|| MessagingError::KeyNotFound(owner_id.to_string()))?;
        let key = import_public_key(&exported)?;
        self.public_keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(owner_id.to_string(), key);
        Ok(key)
    }

    /// The key pair loaded by [`ensure_key_pair`](Self::ensure_key_pair).
    pub fn private_key_of(&self, owner_id: &str) -> Result<IdentityKeyPair, MessagingError> {
        self.cached_pair(owner_id)
            .ok_or_else(|| MessagingError::KeyUnavailable(owner_id.to_string()))
    }

    /// Drop cached key material for `owner_id`. Stored keys are untouched.
    pub fn forget(&self, owner_id: &str) {
        self.key_pairs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(owner_id);
        self.public_keys
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(owner_id);
    }
}

#[cfg(test)]
mod tests {
    use parley_crypto::export_public_key;

    use super::*;
    use crate::store::memory::{MemoryDeviceKeys, MemoryStore};

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryDeviceKeys>, IdentityKeyStore) {
        let directory = Arc::new(MemoryStore::new());
        let device = Arc::new(MemoryDeviceKeys::new());
        let store = IdentityKeyStore::new(directory.clone(), device.clone());
        (directory, device, store)
    }

    #[tokio::test]
    async fn first_use_generates_and_publishes() {
        let (directory, device, identity) = setup();
        let public = identity.ensure_key_pair("alice").await.unwrap();

        let published = directory.fetch_public_key("alice").await.unwrap().unwrap();
        assert_eq!(published, export_public_key(&public));
        assert!(device.load_private_key("alice").await.unwrap().is_some());
        assert!(identity.private_key_of("alice").unwrap().matches_public(&public));
    }

    #[tokio::test]
    async fn existing_pair_is_loaded_not_regenerated() {
        let (directory, device, identity) = setup();
        let first = identity.ensure_key_pair("alice").await.unwrap();

        let fresh = IdentityKeyStore::new(directory, device);
        let second = fresh.ensure_key_pair("alice").await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn missing_private_key_resets_identity() {
        let (directory, device, identity) = setup();
        let old = identity.ensure_key_pair("alice").await.unwrap();
        device.delete_private_key("alice").await.unwrap();

        let fresh = IdentityKeyStore::new(directory.clone(), device.clone());
        let new = fresh.ensure_key_pair("alice").await.unwrap();
        assert_ne!(old.as_bytes(), new.as_bytes());
        assert_eq!(
            directory.fetch_public_key("alice").await.unwrap().unwrap(),
            export_public_key(&new)
        );
    }

    #[tokio::test]
    async fn mismatched_private_key_resets_identity() {
        let (directory, device, identity) = setup();
        let published = identity.ensure_key_pair("alice").await.unwrap();
        let stray = IdentityKeyPair::generate("alice");
        device
            .save_private_key("alice", &stray.export_private())
            .await
            .unwrap();

        let fresh = IdentityKeyStore::new(directory, device);
        let new = fresh.ensure_key_pair("alice").await.unwrap();
        assert_ne!(new.as_bytes(), published.as_bytes());
        assert_ne!(new.as_bytes(), stray.public_key().as_bytes());
    }

    #[tokio::test]
    async fn lost_directory_entry_is_republished() {
        let (_, device, identity) = setup();
        let public = identity.ensure_key_pair("alice").await.unwrap();

        let empty_directory = Arc::new(MemoryStore::new());
        let fresh = IdentityKeyStore::new(empty_directory.clone(), device);
        let again = fresh.ensure_key_pair("alice").await.unwrap();
        assert_eq!(public.as_bytes(), again.as_bytes());
        assert!(empty_directory.fetch_public_key("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_peer_is_key_not_found() {
        let (_, _, identity) = setup();
        let result = identity.public_key_of("ghost").await;
        assert!(matches!(result, Err(MessagingError::KeyNotFound(ref id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn refresh_sees_peer_reset() {
        let (directory, device, identity) = setup();
        let bob = IdentityKeyStore::new(directory.clone(), device.clone());
        let before = bob.ensure_key_pair("bob").await.unwrap();
        assert_eq!(identity.public_key_of("bob").await.unwrap().as_bytes(), before.as_bytes());

        let replacement = IdentityKeyPair::generate("bob");
        directory
            .publish_public_key("bob", &replacement.export_public())
            .await
            .unwrap();

        // Cached lookup still returns the old key until refreshed.
        assert_eq!(identity.public_key_of("bob").await.unwrap().as_bytes(), before.as_bytes());
        let refreshed = identity.refresh_public_key("bob").await.unwrap();
        assert_eq!(refreshed.as_bytes(), replacement.public_key().as_bytes());
    }

    #[tokio::test]
    async fn forget_drops_cached_pair() {
        let (_, _, identity) = setup();
        identity.ensure_key_pair("alice").await.unwrap();
        identity.forget("alice");
        assert!(matches!(
            identity.private_key_of("alice"),
            Err(MessagingError::KeyUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_first_use_yields_one_pair() {
        let (directory, _, identity) = setup();
        let identity = Arc::new(identity);
        let a = tokio::spawn({
            let identity = identity.clone();
            async move { identity.ensure_key_pair("alice").await.unwrap() }
        });
        let b = tokio::spawn({
            let identity = identity.clone();
            async move { identity.ensure_key_pair("alice").await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(
            directory.fetch_public_key("alice").await.unwrap().unwrap(),
            export_public_key(&a)
        );
    }
}
