//! Identity key generation and serialization.
//!
//! Each user has one long-term X25519 key pair. The public half is published
//! to the shared key directory; the private half only ever lands in local
//! device storage. The keys are used for key agreement (session-key
//! wrapping), never for signing.

use parley_protocol::codec::{from_base64, to_base64};
use parley_protocol::UserId;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// X25519 key length in bytes.
pub const KEY_LEN: usize = 32;

/// A user's long-term key pair, loaded on this device.
#[derive(Clone)]
pub struct IdentityKeyPair {
    owner_id: UserId,
    public: PublicKey,
    secret: StaticSecret,
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("owner_id", &self.owner_id)
            .field("public", &export_public_key(&self.public))
            .finish_non_exhaustive()
    }
}

impl IdentityKeyPair {
    /// Generate a fresh key pair for `owner_id`.
    pub fn generate(owner_id: impl Into<UserId>) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            owner_id: owner_id.into(),
            public,
            secret,
        }
    }

    /// Rebuild a key pair from raw private key bytes.
    pub fn from_private_bytes(owner_id: impl Into<UserId>, bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut arr = Zeroizing::new([0u8; KEY_LEN]);
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "private key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        arr.copy_from_slice(bytes);
        let secret = StaticSecret::from(*arr);
        let public = PublicKey::from(&secret);
        Ok(Self {
            owner_id: owner_id.into(),
            public,
            secret,
        })
    }

    /// Rebuild a key pair from its exported (base64) private key.
    pub fn from_exported_private(
        owner_id: impl Into<UserId>,
        exported: &str,
    ) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(from_base64(exported)?);
        Self::from_private_bytes(owner_id, &bytes)
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Portable form of the public key, for the shared directory.
    pub fn export_public(&self) -> String {
        export_public_key(&self.public)
    }

    /// Portable form of the private key, for local device storage only.
    pub fn export_private(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.secret.to_bytes());
        Zeroizing::new(to_base64(bytes.as_ref()))
    }

    /// Raw private key bytes, for sealed on-disk storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Constant-time check that `published` is this pair's public key.
    pub fn matches_public(&self, published: &PublicKey) -> bool {
        self.public.as_bytes()[..]
            .ct_eq(&published.as_bytes()[..])
            .into()
    }
}

/// Serialize a public key to its portable base64 form.
pub fn export_public_key(key: &PublicKey) -> String {
    to_base64(key.as_bytes())
}

/// Parse a public key from its portable base64 form.
pub fn import_public_key(exported: &str) -> Result<PublicKey, CryptoError> {
    let bytes = from_base64(exported)?;
    let arr: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "public key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_roundtrip_private_export() {
        let pair = IdentityKeyPair::generate("alice");
        let exported = pair.export_private();
        let restored = IdentityKeyPair::from_exported_private("alice", &exported).unwrap();
        assert_eq!(pair.public_key().as_bytes(), restored.public_key().as_bytes());
        assert_eq!(restored.owner_id(), "alice");
    }

    #[test]
    fn public_key_serialization() {
        let pair = IdentityKeyPair::generate("alice");
        let restored = import_public_key(&pair.export_public()).unwrap();
        assert!(pair.matches_public(&restored));
    }

    #[test]
    fn foreign_public_key_does_not_match() {
        let alice = IdentityKeyPair::generate("alice");
        let other = IdentityKeyPair::generate("alice");
        assert!(!alice.matches_public(other.public_key()));
    }

    #[test]
    fn short_public_key_rejected() {
        let result = import_public_key(&to_base64(&[1, 2, 3]));
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn short_private_key_rejected() {
        let result = IdentityKeyPair::from_private_bytes("alice", &[0u8; 16]);
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn debug_output_omits_secret() {
        let pair = IdentityKeyPair::generate("alice");
        let debug = format!("{pair:?}");
        assert!(!debug.contains(pair.export_private().as_str()));
        assert!(debug.contains("alice"));
    }
}
