//! Parley cryptographic layer.
//!
//! This crate provides:
//! - Identity key management (X25519, public half exported for the directory)
//! - Session-key wrapping to a participant's public key
//! - Per-conversation AES-256-GCM session keys and the message cipher
//! - Passphrase-sealed private key files for device storage

pub mod cipher;
pub mod error;
pub mod identity;
pub mod persistence;
pub mod session_key;
pub mod wrap;

// Re-export key types for convenience
pub use cipher::{decrypt, decrypt_envelope, encrypt};
pub use error::CryptoError;
pub use identity::{export_public_key, import_public_key, IdentityKeyPair};
pub use session_key::SessionKey;
pub use wrap::{unwrap_session_key, wrap_session_key};
pub use x25519_dalek::PublicKey;
