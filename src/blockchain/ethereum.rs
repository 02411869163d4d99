use async_trait::async_trait;
use ethers::{
    prelude::JsonRpcClient,
    providers::{Http, Middleware, Provider},
    types::{TransactionReceipt, H256},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use super::traits::{ChainProvider, ProviderFactory};
use crate::core::config::ProviderConfig;
use crate::core::errors::BridgeError;

/// JSON-RPC chain access over an ethers provider.
#[derive(Clone)]
pub struct EthereumProvider<P: JsonRpcClient + Clone = Http> {
    provider: Provider<P>,
    chain_id: u64,
    blocks: Arc<watch::Sender<u64>>,
    // Stops the block polling task once the last clone is dropped.
    poll_guard: Option<Arc<DropGuard>>,
}

impl EthereumProvider<Http> {
    /// Connects to `rpc_url` and checks the node reports `expected_chain_id` when given.
    pub async fn connect(
        rpc_url: &str,
        expected_chain_id: Option<u64>,
        config: &ProviderConfig,
    ) -> Result<Self, BridgeError> {
        let rpc_url_clean = rpc_url.trim();
        let parsed_url = reqwest::Url::parse(rpc_url_clean).map_err(|e| {
            BridgeError::Config(format!("Invalid RPC URL '{}': {}", rpc_url_clean, e))
        })?;

        info!(host = parsed_url.host_str().unwrap_or(""), "Connecting to JSON-RPC endpoint");
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout());
        if let Ok(proxy) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("HTTP_PROXY")) {
            if let Ok(p) = reqwest::Proxy::all(proxy) {
                builder = builder.proxy(p);
            }
        }
        let client = builder
            .build()
            .map_err(|e| BridgeError::ProviderUnavailable(format!("HTTP client: {}", e)))?;

        let provider = Provider::new(Http::new_with_client(parsed_url.clone(), client))
            .interval(config.polling_interval());

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| {
                BridgeError::ProviderUnavailable(format!(
                    "Failed to get chain ID from {}: {}",
                    parsed_url.host_str().unwrap_or("rpc"),
                    e
                ))
            })?
            .as_u64();

        if let Some(expected) = expected_chain_id {
            if expected != chain_id {
                return Err(BridgeError::Config(format!(
                    "RPC endpoint reports chain {} but chain {} was expected",
                    chain_id, expected
                )));
            }
        }

        info!(chain_id, "Connected");
        Ok(Self::new_with_provider(provider, chain_id).with_block_polling(config.polling_interval()))
    }
}

impl<P> EthereumProvider<P>
where
    P: JsonRpcClient + Clone + Send + Sync + 'static,
{
    /// Wraps an existing provider without starting block polling.
    /// This is useful for testing with a `MockProvider`.
    pub fn new_with_provider(provider: Provider<P>, chain_id: u64) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self { provider, chain_id, blocks: Arc::new(tx), poll_guard: None }
    }

    /// Starts a background task publishing new block numbers every `interval`.
    pub fn with_block_polling(mut self, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let provider = self.provider.clone();
        let blocks = self.blocks.clone();
        let chain_id = self.chain_id;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        match provider.get_block_number().await {
                            Ok(n) => {
                                let n = n.as_u64();
                                blocks.send_if_modified(|cur| {
                                    if n > *cur {
                                        *cur = n;
                                        true
                                    } else {
                                        false
                                    }
                                });
                            }
                            Err(e) => debug!(chain_id, "block poll failed: {}", e),
                        }
                    }
                }
            }
            debug!(chain_id, "block polling stopped");
        });

        self.poll_guard = Some(Arc::new(token.drop_guard()));
        self
    }
}

#[async_trait]
impl<P> ChainProvider for EthereumProvider<P>
where
    P: JsonRpcClient + Clone + Send + Sync + 'static,
{
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, BridgeError> {
        debug!(chain_id = self.chain_id, tx_hash, "Fetching receipt");
        let hash = H256::from_str(tx_hash).map_err(|e| {
            BridgeError::InvalidSubmission(format!("Invalid transaction hash {}: {}", tx_hash, e))
        })?;
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }

    async fn get_block_number(&self) -> Result<u64, BridgeError> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    fn subscribe_blocks(&self) -> watch::Receiver<u64> {
        self.blocks.subscribe()
    }
}

/// Opens HTTP providers for partner chains.
#[derive(Debug, Clone, Default)]
pub struct EthereumProviderFactory {
    config: ProviderConfig,
}

impl EthereumProviderFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProviderFactory for EthereumProviderFactory {
    async fn connect(
        &self,
        chain_id: u64,
        rpc_url: &str,
    ) -> Result<Arc<dyn ChainProvider>, BridgeError> {
        let provider = EthereumProvider::connect(rpc_url, Some(chain_id), &self.config).await?;
        Ok(Arc::new(provider))
    }
}
