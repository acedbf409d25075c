//! Session-key wrapping under a participant's identity public key.
//!
//! Ephemeral-static X25519 agreement, HKDF-SHA256 to a one-time key
//! encryption key, then AES-256-GCM over the raw session key with the
//! session id as associated data.
//!
//! Wrapped format: [ephemeral public(32)] [nonce(12)] [sealed key + tag(48)]

use hkdf::Hkdf;
use parley_protocol::WrappedKey;
use rand::rngs::OsRng;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, KEY_LEN};
use crate::session_key::{SessionKey, SESSION_KEY_LEN};

const WRAP_INFO: &[u8] = b"parley/session-key-wrap/v1";

/// AES-256-GCM tag size.
const TAG_LEN: usize = 16;

/// Total size of a wrapped session key.
pub const WRAPPED_KEY_LEN: usize = KEY_LEN + NONCE_LEN + SESSION_KEY_LEN + TAG_LEN;

fn derive_kek(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<LessSafeKey, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared_secret);
    let mut kek = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, kek.as_mut())
        .map_err(|_| CryptoError::Wrap)?;

    let unbound = UnboundKey::new(&AES_256_GCM, kek.as_ref()).map_err(|_| CryptoError::Wrap)?;
    Ok(LessSafeKey::new(unbound))
}

/// Wrap `key` so that only the holder of `recipient`'s private key can recover it.
pub fn wrap_session_key(recipient: &PublicKey, key: &SessionKey) -> Result<WrappedKey, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("recipient public key is low-order".into()));
    }

    let kek = derive_kek(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| CryptoError::Rng)?;

    let mut in_out = key.as_bytes().to_vec();
    kek.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(key.session_id().as_bytes()),
        &mut in_out,
    )
    .map_err(|_| CryptoError::Wrap)?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(ephemeral_public.as_bytes());
    wrapped.extend_from_slice(&nonce_bytes);
    wrapped.extend_from_slice(&in_out);
    Ok(WrappedKey(wrapped))
}

/// Recover the session key for `session_id` from a copy wrapped for `identity`.
pub fn unwrap_session_key(
    identity: &IdentityKeyPair,
    session_id: &str,
    wrapped: &WrappedKey,
) -> Result<SessionKey, CryptoError> {
    let data = wrapped.0.as_slice();
    if data.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::Unwrap);
    }

    let mut ephemeral_bytes = [0u8; KEY_LEN];
    ephemeral_bytes.copy_from_slice(&data[..KEY_LEN]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&data[KEY_LEN..KEY_LEN + NONCE_LEN]);

    let shared = identity.secret().diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::Unwrap);
    }
    let kek = derive_kek(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        identity.public_key().as_bytes(),
    )
    .map_err(|_| CryptoError::Unwrap)?;

    let mut in_out = Zeroizing::new(data[KEY_LEN + NONCE_LEN..].to_vec());
    let raw = kek
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(session_id.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Unwrap)?;

    SessionKey::from_bytes(session_id, raw)
}
