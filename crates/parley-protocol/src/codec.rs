use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Encode raw bytes as standard (padded) base64.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64 into raw bytes.
pub fn from_base64(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(STANDARD.decode(text)?)
}

/// Serialize a stored document (conversation, session record, message) to JSON bytes.
pub fn encode_document<T: Serialize>(doc: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec_pretty(doc)?)
}

/// Deserialize a stored document from JSON bytes.
pub fn decode_document<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serde adapter storing `Vec<u8>` fields as base64 strings.
pub mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::from_base64(&text).map_err(serde::de::Error::custom)
    }
}
