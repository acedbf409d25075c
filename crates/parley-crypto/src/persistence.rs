//! Passphrase-sealed private key files for local device storage.
//!
//! PBKDF2-HMAC-SHA256 + AES-256-GCM, the same pattern used for other
//! at-rest secrets on the device.

use std::num::NonZeroU32;

use parley_protocol::UserId;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::identity::{IdentityKeyPair, KEY_LEN};

const MAGIC: &[u8; 4] = b"PRLK"; // "PaRLey Key"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + 4 + SALT_LEN + NONCE_LEN + 4; // 57 bytes

/// Default PBKDF2 work factor for sealed key files.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SealedIdentity {
    owner_id: UserId,
    private_key: [u8; KEY_LEN],
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], iterations: u32) -> Result<LessSafeKey, CryptoError> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| CryptoError::Persistence("iteration count must be non-zero".into()))?;
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        key_bytes.as_mut(),
    );
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_ref())
        .map_err(|_| CryptoError::Persistence("derived key rejected".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn aad_bytes() -> [u8; 5] {
    let mut aad = [0u8; 5];
    aad[..4].copy_from_slice(MAGIC);
    aad[4] = VERSION;
    aad
}

/// Seal a private key under `passphrase` with the default work factor.
pub fn seal_private_key(pair: &IdentityKeyPair, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    seal_private_key_with_iterations(pair, passphrase, DEFAULT_PBKDF2_ITERATIONS)
}

/// Seal a private key to a binary blob for disk storage.
///
/// File format: [PRLK magic(4)] [version(1)] [iterations(4)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
pub fn seal_private_key_with_iterations(
    pair: &IdentityKeyPair,
    passphrase: &str,
    iterations: u32,
) -> Result<Vec<u8>, CryptoError> {
    let rng = SystemRandom::new();

    let payload = SealedIdentity {
        owner_id: pair.owner_id().to_string(),
        private_key: *pair.private_bytes(),
    };
    let plaintext = postcard::to_allocvec(&payload)
        .map_err(|e| CryptoError::Persistence(format!("serialization failed: {e}")))?;

    let mut salt = [0u8; SALT_LEN];
    rng.fill(&mut salt).map_err(|_| CryptoError::Rng)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;

    let key = derive_key(passphrase, &salt, iterations)?;
    let mut in_out = Zeroizing::new(plaintext);
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::from(&aad_bytes()),
        &mut *in_out,
    )
    .map_err(|_| CryptoError::Persistence("encryption failed".into()))?;

    let payload_len = in_out.len() as u32;
    let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
    file_data.extend_from_slice(MAGIC);
    file_data.push(VERSION);
    file_data.extend_from_slice(&iterations.to_be_bytes());
    file_data.extend_from_slice(&salt);
    file_data.extend_from_slice(&nonce_bytes);
    file_data.extend_from_slice(&payload_len.to_be_bytes());
    file_data.extend_from_slice(&in_out);

    Ok(file_data)
}

/// Open a sealed key file and rebuild the key pair for `expected_owner`.
pub fn open_private_key(
    file_data: &[u8],
    expected_owner: &str,
    passphrase: &str,
) -> Result<IdentityKeyPair, CryptoError> {
    if file_data.len() < HEADER_LEN {
        return Err(CryptoError::Persistence("file too short".into()));
    }
    if &file_data[0..4] != MAGIC {
        return Err(CryptoError::Persistence(
            "invalid file format (expected PRLK header)".into(),
        ));
    }
    if file_data[4] != VERSION {
        return Err(CryptoError::Persistence("unsupported file version".into()));
    }

    let mut iter_bytes = [0u8; 4];
    iter_bytes.copy_from_slice(&file_data[5..9]);
    let iterations = u32::from_be_bytes(iter_bytes);

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&file_data[9..9 + SALT_LEN]);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&file_data[41..41 + NONCE_LEN]);

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&file_data[53..57]);
    let payload_len = u32::from_be_bytes(len_bytes) as usize;

    if file_data.len() < HEADER_LEN + payload_len {
        return Err(CryptoError::Persistence("file truncated".into()));
    }

    let key = derive_key(passphrase, &salt, iterations)?;
    let mut ciphertext = Zeroizing::new(file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec());
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(&aad_bytes()),
            &mut ciphertext,
        )
        .map_err(|_| CryptoError::Persistence("incorrect passphrase or corrupted file".into()))?;

    let sealed: SealedIdentity = postcard::from_bytes(plaintext)
        .map_err(|e| CryptoError::Persistence(format!("deserialization failed: {e}")))?;
    if sealed.owner_id != expected_owner {
        return Err(CryptoError::Persistence(format!(
            "key file belongs to {}, not {expected_owner}",
            sealed.owner_id
        )));
    }

    IdentityKeyPair::from_private_bytes(sealed.owner_id.clone(), &sealed.private_key)
}

/// Check if file data starts with a valid PRLK header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn seal_and_open_roundtrip() {
        let pair = IdentityKeyPair::generate("alice");
        let sealed = seal_private_key_with_iterations(&pair, "hunter2", FAST).unwrap();
        assert!(has_valid_header(&sealed));

        let opened = open_private_key(&sealed, "alice", "hunter2").unwrap();
        assert!(opened.matches_public(pair.public_key()));
    }

    #[test]
    fn wrong_passphrase_fails() {
        let pair = IdentityKeyPair::generate("alice");
        let sealed = seal_private_key_with_iterations(&pair, "hunter2", FAST).unwrap();
        let err = open_private_key(&sealed, "alice", "hunter3").unwrap_err();
        assert!(err.to_string().contains("incorrect passphrase"));
    }

    #[test]
    fn owner_mismatch_fails() {
        let pair = IdentityKeyPair::generate("alice");
        let sealed = seal_private_key_with_iterations(&pair, "pw", FAST).unwrap();
        assert!(open_private_key(&sealed, "bob", "pw").is_err());
    }

    #[test]
    fn truncated_file_fails() {
        let pair = IdentityKeyPair::generate("alice");
        let sealed = seal_private_key_with_iterations(&pair, "pw", FAST).unwrap();
        assert!(open_private_key(&sealed[..HEADER_LEN + 3], "alice", "pw").is_err());
        assert!(open_private_key(&sealed[..10], "alice", "pw").is_err());
    }

    #[test]
    fn rejects_foreign_header() {
        let mut data = vec![0u8; HEADER_LEN + 16];
        data[..4].copy_from_slice(b"VSIG");
        assert!(!has_valid_header(&data));
        assert!(open_private_key(&data, "alice", "pw").is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let pair = IdentityKeyPair::generate("alice");
        assert!(seal_private_key_with_iterations(&pair, "pw", 0).is_err());
    }
}
