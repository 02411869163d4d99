use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::blockchain::network::NetworkDetail;
use crate::core::errors::BridgeError;

/// What the poller does when a `deposit-l2` leg needs a redeem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoRedeemPolicy {
    /// The poller synthesizes the `deposit-l2-auto-redeem` record itself.
    #[default]
    Automatic,
    /// The poller only flags the leg; the user submits the redeem record.
    Manual,
}

/// Status poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Fallback pass interval when no block notifications arrive (seconds)
    #[serde(default = "PollerConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Block notifications closer together than this coalesce into one pass (milliseconds)
    #[serde(default = "PollerConfig::default_min_pass_interval_ms")]
    pub min_pass_interval_ms: u64,

    /// Bounded wait for a single receipt query (seconds)
    #[serde(default = "PollerConfig::default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,

    /// A transaction without a receipt after this long is classified as failed (seconds)
    #[serde(default = "PollerConfig::default_max_wait_secs")]
    pub max_wait_secs: u64,

    /// Record queries in flight at once during a pass
    #[serde(default = "PollerConfig::default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    #[serde(default)]
    pub auto_redeem: AutoRedeemPolicy,
}

impl PollerConfig {
    fn default_poll_interval_secs() -> u64 { 15 }
    fn default_min_pass_interval_ms() -> u64 { 1_000 }
    fn default_receipt_timeout_secs() -> u64 { 10 }
    fn default_max_wait_secs() -> u64 { 86_400 }
    fn default_max_concurrent_queries() -> usize { 8 }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn min_pass_interval(&self) -> Duration {
        Duration::from_millis(self.min_pass_interval_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: Self::default_poll_interval_secs(),
            min_pass_interval_ms: Self::default_min_pass_interval_ms(),
            receipt_timeout_secs: Self::default_receipt_timeout_secs(),
            max_wait_secs: Self::default_max_wait_secs(),
            max_concurrent_queries: Self::default_max_concurrent_queries(),
            auto_redeem: AutoRedeemPolicy::default(),
        }
    }
}

/// JSON-RPC provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// New-block polling interval for providers the engine creates itself (milliseconds)
    #[serde(default = "ProviderConfig::default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// HTTP request timeout (seconds)
    #[serde(default = "ProviderConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Appended to infura RPC URLs
    #[serde(default)]
    pub infura_project_id: Option<String>,
}

impl ProviderConfig {
    fn default_polling_interval_ms() -> u64 { 15_000 }
    fn default_request_timeout_secs() -> u64 { 10 }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms.max(100))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: Self::default_polling_interval_ms(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            infura_project_id: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_database_url")]
    pub database_url: String,
}

impl StorageConfig {
    fn default_database_url() -> String {
        "sqlite://./data/bridge.db?mode=rwc".to_string()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_url: Self::default_database_url() }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub poller: PollerConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Replaces the built-in network registry when non-empty
    #[serde(default)]
    pub networks: Vec<NetworkDetail>,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, BridgeError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(BridgeError::Config(format!("{}: {}", path.display(), e))),
        };
        config.apply_env_overrides();
        config.validate()?;
        info!(
            networks = config.networks.len(),
            poll_interval_secs = config.poller.poll_interval_secs,
            "Loaded engine configuration"
        );
        Ok(config)
    }

    /// `DATABASE_URL` and `INFURA_PROJECT_ID` take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                self.storage.database_url = url.trim().to_string();
            }
        }
        if let Ok(id) = std::env::var("INFURA_PROJECT_ID") {
            if !id.trim().is_empty() {
                self.provider.infura_project_id = Some(id.trim().to_string());
            }
        }
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.poller.max_concurrent_queries == 0 {
            return Err(BridgeError::Config("poller.max_concurrent_queries must be > 0".into()));
        }
        for net in &self.networks {
            if let Some(partner) = net.partner_chain_id {
                if partner == net.chain_id {
                    return Err(BridgeError::Config(format!(
                        "network {} lists itself as partner",
                        net.chain_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.poller.poll_interval_secs, 15);
        assert_eq!(cfg.poller.receipt_timeout_secs, 10);
        assert_eq!(cfg.poller.auto_redeem, AutoRedeemPolicy::Automatic);
        assert_eq!(cfg.provider.polling_interval_ms, 15_000);
        assert!(cfg.networks.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [poller]
            poll_interval_secs = 5
            auto_redeem = "manual"

            [storage]
            database_url = "sqlite::memory:"

            [[networks]]
            chain_id = 1
            name = "Ethereum"
            is_rollup = false
            partner_chain_id = 42161
            rpc_urls = ["https://mainnet.infura.io/v3"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.poller.poll_interval_secs, 5);
        assert_eq!(cfg.poller.max_wait_secs, 86_400);
        assert_eq!(cfg.poller.auto_redeem, AutoRedeemPolicy::Manual);
        assert_eq!(cfg.storage.database_url, "sqlite::memory:");
        assert_eq!(cfg.networks.len(), 1);
        assert_eq!(cfg.networks[0].partner_chain_id, Some(42161));
    }

    #[test]
    fn test_validate_rejects_self_partner() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            [[networks]]
            chain_id = 5
            name = "Loop"
            is_rollup = false
            partner_chain_id = 5
            rpc_urls = []
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.poller.max_concurrent_queries, 8);
    }
}
