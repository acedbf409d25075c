use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("system RNG failed")]
    Rng,

    #[error("failed to wrap session key")]
    Wrap,

    #[error("failed to unwrap session key (wrong private key or corrupted record)")]
    Unwrap,

    #[error("message encryption failed")]
    Encrypt,

    #[error("message decryption failed (authentication or format mismatch)")]
    DecryptFailure,

    #[error("sealed key file: {0}")]
    Persistence(String),

    #[error(transparent)]
    Encoding(#[from] parley_protocol::ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_key_display() {
        let e = CryptoError::InvalidKey("expected 32 bytes, got 7".into());
        assert!(e.to_string().contains("got 7"));
    }

    #[test]
    fn from_protocol_error() {
        let proto = parley_protocol::codec::from_base64("***").unwrap_err();
        let e: CryptoError = proto.into();
        assert!(matches!(e, CryptoError::Encoding(_)));
    }
}
