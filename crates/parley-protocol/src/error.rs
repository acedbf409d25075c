use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("document serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("conversation must have exactly two distinct participants")]
    InvalidParticipants,
}
