//! Message encryption under a resident session key.
//!
//! AES-256-GCM with a fresh random 96-bit IV per message. The session id is
//! bound as associated data, so an envelope only opens under the key of the
//! session it names.

use parley_protocol::Envelope;
use ring::aead::{Aad, Nonce, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::CryptoError;
use crate::session_key::SessionKey;

/// AES-256-GCM IV length in bytes.
pub const IV_LEN: usize = NONCE_LEN;

/// Encrypt UTF-8 `plaintext` into a transport envelope.
pub fn encrypt(plaintext: &str, key: &SessionKey) -> Result<Envelope, CryptoError> {
    let aead_key = key.to_aead_key().map_err(|_| CryptoError::Encrypt)?;

    let mut iv = [0u8; IV_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| CryptoError::Rng)?;

    let mut in_out = plaintext.as_bytes().to_vec();
    aead_key
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(key.session_id().as_bytes()),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Encrypt)?;

    Ok(Envelope {
        session_id: key.session_id().to_string(),
        ciphertext: in_out,
        iv: iv.to_vec(),
    })
}

/// Decrypt `ciphertext` produced under `key` with initialization vector `iv`.
pub fn decrypt(ciphertext: &[u8], iv: &[u8], key: &SessionKey) -> Result<String, CryptoError> {
    let nonce = Nonce::try_assume_unique_for_key(iv).map_err(|_| CryptoError::DecryptFailure)?;
    let aead_key = key.to_aead_key().map_err(|_| CryptoError::DecryptFailure)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = aead_key
        .open_in_place(nonce, Aad::from(key.session_id().as_bytes()), &mut in_out)
        .map_err(|_| CryptoError::DecryptFailure)?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::DecryptFailure)
}

/// Decrypt a stored envelope. Fails if it names a different session than `key`.
pub fn decrypt_envelope(envelope: &Envelope, key: &SessionKey) -> Result<String, CryptoError> {
    if envelope.session_id != key.session_id() {
        return Err(CryptoError::DecryptFailure);
    }
    decrypt(&envelope.ciphertext, &envelope.iv, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SessionKey::generate("s1").unwrap();
        let envelope = encrypt("hello", &key).unwrap();
        assert_ne!(envelope.ciphertext, b"hello");
        assert_eq!(envelope.iv.len(), IV_LEN);
        assert_eq!(envelope.session_id, "s1");

        let text = decrypt(&envelope.ciphertext, &envelope.iv, &key).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn unicode_and_empty_roundtrip() {
        let key = SessionKey::generate("s1").unwrap();
        let long = "x".repeat(10_000);
        for text in ["", "grüße 👋", long.as_str()] {
            let envelope = encrypt(text, &key).unwrap();
            assert_eq!(decrypt_envelope(&envelope, &key).unwrap(), text);
        }
    }

    #[test]
    fn ivs_are_not_reused() {
        let key = SessionKey::generate("s1").unwrap();
        let a = encrypt("same", &key).unwrap();
        let b = encrypt("same", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = SessionKey::generate("s1").unwrap();
        let key2 = SessionKey::generate("s1").unwrap();
        let envelope = encrypt("secret", &key1).unwrap();
        let result = decrypt(&envelope.ciphertext, &envelope.iv, &key2);
        assert!(matches!(result, Err(CryptoError::DecryptFailure)));
    }

    #[test]
    fn wrong_iv_fails() {
        let key = SessionKey::generate("s1").unwrap();
        let envelope = encrypt("secret", &key).unwrap();
        let mut iv = envelope.iv.clone();
        iv[0] ^= 0x01;
        assert!(decrypt(&envelope.ciphertext, &iv, &key).is_err());
        assert!(decrypt(&envelope.ciphertext, &iv[..8], &key).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SessionKey::generate("s1").unwrap();
        let mut envelope = encrypt("secret", &key).unwrap();
        envelope.ciphertext[0] ^= 0xFF;
        assert!(decrypt_envelope(&envelope, &key).is_err());
    }

    #[test]
    fn envelope_from_other_session_rejected() {
        let key = SessionKey::generate("s1").unwrap();
        let mut envelope = encrypt("secret", &key).unwrap();
        envelope.session_id = "s2".into();
        assert!(matches!(
            decrypt_envelope(&envelope, &key),
            Err(CryptoError::DecryptFailure)
        ));
    }
}
