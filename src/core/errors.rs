use thiserror::Error;

/// Errors produced by the bridge lifecycle engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// RPC endpoint unreachable or returned a transport error. Retried on the next trigger.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A session resolution was superseded by newer inputs before it could commit.
    #[error("Session resolution aborted")]
    SessionResolutionAborted,

    /// The cross-chain message bookkeeping could not be queried.
    #[error("Message state query failed: {0}")]
    MessageStateQueryFailed(String),

    /// The transaction was mined with a failed status.
    #[error("Transaction {tx_hash} reverted on chain {chain_id}")]
    TransactionReverted { chain_id: u64, tx_hash: String },

    /// A draft submitted through the command surface was malformed.
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// Outbox execution was requested for a message that is not in the `confirmed` state.
    #[error("Outbox execution not permitted for {tx_hash}: message is {state}")]
    OutboxExecutionIneligible { tx_hash: String, state: String },

    /// Record or chain not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Local durable storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be read or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bounded wait elapsed.
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl BridgeError {
    /// Transient failures the poller recovers from by retrying on its next pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::ProviderUnavailable(_)
                | BridgeError::MessageStateQueryFailed(_)
                | BridgeError::Timeout(_)
        )
    }

    /// Errors that should be shown to whoever issued the command.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidSubmission(_)
                | BridgeError::OutboxExecutionIneligible { .. }
                | BridgeError::TransactionReverted { .. }
        )
    }
}

impl From<ethers::providers::ProviderError> for BridgeError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        BridgeError::ProviderUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Storage(format!("serialization: {}", err))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}
