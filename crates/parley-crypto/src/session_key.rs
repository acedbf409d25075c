//! Per-conversation symmetric session keys.
//!
//! A session key is a random 256-bit AES-GCM key bound to one session id.
//! It is distributed to participants only in wrapped form (see `wrap`) and
//! kept resident in memory once unwrapped.

use parley_protocol::SessionId;
use ring::aead::{LessSafeKey, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Session key length in bytes (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// An unwrapped session key, resident on this device.
#[derive(Clone)]
pub struct SessionKey {
    session_id: SessionId,
    key_bytes: Zeroizing<[u8; SESSION_KEY_LEN]>,
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionKey {
    /// Generate a fresh random key for `session_id`.
    pub fn generate(session_id: impl Into<SessionId>) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut key_bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        rng.fill(key_bytes.as_mut()).map_err(|_| CryptoError::Rng)?;
        Ok(Self {
            session_id: session_id.into(),
            key_bytes,
        })
    }

    /// Rebuild a key from raw bytes (the result of unwrapping).
    pub fn from_bytes(session_id: impl Into<SessionId>, bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SESSION_KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "session key must be {SESSION_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        key_bytes.copy_from_slice(bytes);
        Ok(Self {
            session_id: session_id.into(),
            key_bytes,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key_bytes
    }

    /// Create an AES-256-GCM key from the raw bytes.
    pub(crate) fn to_aead_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, self.key_bytes.as_ref())
            .map_err(|_| CryptoError::InvalidKey("session key rejected by AES-256-GCM".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}
