use std::path::PathBuf;

use parley_messaging::MessagingConfig;
use serde::Deserialize;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct CliConfig {
    /// Root of the data directory. `shared/` holds the document store and
    /// public key directory, `device/` holds this device's private keys.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Environment variable holding the passphrase that seals private key
    /// files. Keys are stored unsealed when unset.
    #[serde(default)]
    pub passphrase_env: Option<String>,

    #[serde(default)]
    pub messaging: MessagingConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley")
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            passphrase_env: None,
            messaging: MessagingConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn shared_dir(&self) -> PathBuf {
        self.data_dir.join("shared")
    }

    pub fn device_dir(&self) -> PathBuf {
        self.data_dir.join("device")
    }
}
