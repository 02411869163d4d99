pub mod config;
pub mod errors;
pub mod validation;

pub use config::{AutoRedeemPolicy, EngineConfig, PollerConfig, ProviderConfig, StorageConfig};
pub use errors::BridgeError;
