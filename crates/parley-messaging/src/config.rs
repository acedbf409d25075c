use serde::{Deserialize, Serialize};

/// Messaging behaviour knobs. Loaded from the `[messaging]` table of the
/// CLI config file; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Append unencrypted messages when session establishment fails.
    #[serde(default)]
    pub allow_plaintext_fallback: bool,

    /// How many times a lost conditional attach is retried by adopting the
    /// winner's session before giving up.
    #[serde(default = "default_max_attach_retries")]
    pub max_attach_retries: u32,

    /// Text shown in place of a message that cannot be decrypted.
    #[serde(default = "default_unavailable_placeholder")]
    pub unavailable_placeholder: String,

    /// Preview length for plaintext-fallback messages, in characters.
    #[serde(default = "default_preview_max_chars")]
    pub preview_max_chars: usize,
}

fn default_max_attach_retries() -> u32 {
    3
}

fn default_unavailable_placeholder() -> String {
    "message unavailable".into()
}

fn default_preview_max_chars() -> usize {
    64
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            allow_plaintext_fallback: false,
            max_attach_retries: default_max_attach_retries(),
            unavailable_placeholder: default_unavailable_placeholder(),
            preview_max_chars: default_preview_max_chars(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: MessagingConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.allow_plaintext_fallback);
        assert_eq!(config.max_attach_retries, 3);
        assert_eq!(config.unavailable_placeholder, "message unavailable");
        assert_eq!(config.preview_max_chars, 64);
    }

    #[test]
    fn partial_override() {
        let config: MessagingConfig =
            serde_json::from_str(r#"{"allow_plaintext_fallback": true, "max_attach_retries": 0}"#)
                .unwrap();
        assert!(config.allow_plaintext_fallback);
        assert_eq!(config.max_attach_retries, 0);
        assert_eq!(config.unavailable_placeholder, "message unavailable");
    }
}
