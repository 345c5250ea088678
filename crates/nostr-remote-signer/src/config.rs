use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_bootstrap_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.primal.net".to_string(),
        "wss://purplepag.es".to_string(),
    ]
}

/// Remote signer (NIP-46) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Upper bound for one RPC round trip.
    pub request_timeout_ms: u64,
    /// How far back the reply subscription looks.
    pub subscription_lookback_secs: u64,
    /// Pause between opening the reply subscription and publishing the request.
    pub settle_delay_ms: u64,
    /// Capacity of the reply de-duplication set.
    pub dedup_capacity: usize,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 120_000,
            subscription_lookback_secs: 120,
            settle_delay_ms: 250,
            dedup_capacity: crate::dedup::DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl SignerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Relay list (NIP-65) discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayListConfig {
    pub bootstrap_relays: Vec<String>,
    pub ttl_ms: u64,
    pub cache_capacity: usize,
    pub fetch_timeout_ms: u64,
}

impl Default for RelayListConfig {
    fn default() -> Self {
        Self {
            bootstrap_relays: default_bootstrap_relays(),
            ttl_ms: 3_600_000,
            cache_capacity: 500,
            fetch_timeout_ms: 5_000,
        }
    }
}

impl RelayListConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signer: SignerConfig,
    pub relay_list: RelayListConfig,

    /// Path the config was loaded from
    #[serde(skip)]
    pub path: PathBuf,
}

impl Config {
    /// Load `config.json` from `data_dir`, falling back to defaults when absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if !config_path.exists() {
            return Ok(Config {
                path: config_path,
                ..Default::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| Error::Storage(format!("Failed to read config file: {}", e)))?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.path = config_path;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, content)
            .map_err(|e| Error::Storage(format!("Failed to write config file: {}", e)))
    }
}
