//! Dual-chain session: which provider/signer serves the base chain and which
//! serves the rollup for the active account.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::network::NetworkRegistry;
use crate::blockchain::traits::{ChainProvider, ProviderFactory};
use crate::core::errors::BridgeError;

/// Resolved chain ids for the active connection. `None` means "not resolvable yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainIdPair {
    pub base_chain_id: Option<u64>,
    pub rollup_chain_id: Option<u64>,
    pub active_chain_id: Option<u64>,
    pub partner_chain_id: Option<u64>,
}

/// Side of the bridge a chain sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainRole {
    Base,
    Rollup,
}

impl ChainRole {
    fn of(registry: &NetworkRegistry, chain_id: u64) -> Self {
        if registry.is_rollup(chain_id) {
            ChainRole::Rollup
        } else {
            ChainRole::Base
        }
    }

    /// Orders `(active, partner)` values as `(base, rollup)`.
    fn assign<T>(self, active: T, partner: T) -> (T, T) {
        match self {
            ChainRole::Base => (active, partner),
            ChainRole::Rollup => (partner, active),
        }
    }
}

impl ChainIdPair {
    pub fn resolve(registry: &NetworkRegistry, active_chain_id: Option<u64>) -> Self {
        let Some(active) = active_chain_id else {
            return Self::default();
        };
        let partner = registry.partner_of(active).filter(|p| registry.contains(*p));
        let (base, rollup) = match partner {
            Some(partner) => {
                let (b, r) = ChainRole::of(registry, active).assign(active, partner);
                (Some(b), Some(r))
            }
            None => (None, None),
        };
        Self {
            base_chain_id: base,
            rollup_chain_id: rollup,
            active_chain_id: Some(active),
            partner_chain_id: partner,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.base_chain_id.is_some() && self.rollup_chain_id.is_some()
    }
}

/// Where a signer's provider came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerOrigin {
    /// The already-connected wallet session.
    Wallet,
    /// A provider opened against the partner chain's RPC endpoint.
    PartnerRpc,
}

/// Account bound to one chain's provider.
#[derive(Clone)]
pub struct ChainSigner {
    pub chain_id: u64,
    pub account: String,
    pub provider: Arc<dyn ChainProvider>,
    pub origin: SignerOrigin,
}

impl fmt::Debug for ChainSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainSigner")
            .field("chain_id", &self.chain_id)
            .field("account", &self.account)
            .field("origin", &self.origin)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub chain_ids: ChainIdPair,
    pub base: ChainSigner,
    pub rollup: ChainSigner,
}

impl BridgeSession {
    pub fn provider_for(&self, chain_id: u64) -> Option<Arc<dyn ChainProvider>> {
        if self.base.chain_id == chain_id {
            Some(self.base.provider.clone())
        } else if self.rollup.chain_id == chain_id {
            Some(self.rollup.provider.clone())
        } else {
            None
        }
    }

    pub fn account(&self) -> &str {
        &self.base.account
    }
}

/// Active wallet connection, as reported by the wallet layer.
#[derive(Clone, Default)]
pub struct SessionInputs {
    pub active_chain_id: Option<u64>,
    pub account: Option<String>,
    pub wallet: Option<Arc<dyn ChainProvider>>,
}

impl SessionInputs {
    pub fn new(chain_id: u64, account: &str, wallet: Arc<dyn ChainProvider>) -> Self {
        Self {
            active_chain_id: Some(chain_id),
            account: Some(account.to_ascii_lowercase()),
            wallet: Some(wallet),
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }
}

struct Attempt {
    generation: u64,
    token: CancellationToken,
}

/// Owns the single active [`BridgeSession`]. Each input change cancels the
/// in-flight resolution and starts a new one; a cancelled attempt never commits.
#[derive(Clone)]
pub struct ChainSessionManager {
    registry: Arc<NetworkRegistry>,
    factory: Arc<dyn ProviderFactory>,
    infura_project_id: Option<String>,
    attempt: Arc<Mutex<Attempt>>,
    session: Arc<watch::Sender<Option<Arc<BridgeSession>>>>,
    chain_ids: Arc<watch::Sender<ChainIdPair>>,
}

impl ChainSessionManager {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        factory: Arc<dyn ProviderFactory>,
        infura_project_id: Option<String>,
    ) -> Self {
        let (session, _) = watch::channel(None);
        let (chain_ids, _) = watch::channel(ChainIdPair::default());
        Self {
            registry,
            factory,
            infura_project_id,
            attempt: Arc::new(Mutex::new(Attempt { generation: 0, token: CancellationToken::new() })),
            session: Arc::new(session),
            chain_ids: Arc::new(chain_ids),
        }
    }

    pub fn registry(&self) -> &Arc<NetworkRegistry> {
        &self.registry
    }

    pub fn current(&self) -> Option<Arc<BridgeSession>> {
        self.session.borrow().clone()
    }

    pub fn chain_ids(&self) -> ChainIdPair {
        *self.chain_ids.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<BridgeSession>>> {
        self.session.subscribe()
    }

    pub fn subscribe_chain_ids(&self) -> watch::Receiver<ChainIdPair> {
        self.chain_ids.subscribe()
    }

    /// Applies new wallet inputs. The chain-id pair is published at once; the
    /// session is cleared and, if the inputs are resolvable, rebuilt on a
    /// background task whose handle is returned.
    pub fn set_inputs(
        &self,
        inputs: SessionInputs,
    ) -> Option<JoinHandle<Result<Arc<BridgeSession>, BridgeError>>> {
        let pair = ChainIdPair::resolve(&self.registry, inputs.active_chain_id);
        self.chain_ids.send_replace(pair);

        let (generation, token) = {
            let mut attempt = self.attempt.lock();
            attempt.token.cancel();
            attempt.token = CancellationToken::new();
            attempt.generation += 1;
            self.session.send_replace(None);
            (attempt.generation, attempt.token.clone())
        };

        let (Some(account), Some(wallet)) = (inputs.account, inputs.wallet) else {
            debug!(generation, "No wallet connected; session cleared");
            return None;
        };
        if !pair.is_complete() {
            info!(chain_id = ?pair.active_chain_id, "Active chain is not part of a known bridge pair");
            return None;
        }

        let manager = self.clone();
        Some(tokio::spawn(async move {
            let result = manager.resolve(pair, account, wallet, token).await;
            match &result {
                Ok(session) => info!(
                    generation,
                    base = session.base.chain_id,
                    rollup = session.rollup.chain_id,
                    "Bridge session ready"
                ),
                Err(BridgeError::SessionResolutionAborted) => {
                    debug!(generation, "Superseded session resolution discarded")
                }
                Err(e) => warn!(generation, "Session resolution failed: {}", e),
            }
            result
        }))
    }

    async fn resolve(
        &self,
        pair: ChainIdPair,
        account: String,
        wallet: Arc<dyn ChainProvider>,
        token: CancellationToken,
    ) -> Result<Arc<BridgeSession>, BridgeError> {
        if token.is_cancelled() {
            return Err(BridgeError::SessionResolutionAborted);
        }
        let (Some(active), Some(partner)) = (pair.active_chain_id, pair.partner_chain_id) else {
            return Err(BridgeError::Config("chain pair not resolvable".into()));
        };
        if wallet.chain_id() != active {
            return Err(BridgeError::Config(format!(
                "wallet provider is on chain {} but chain {} is active",
                wallet.chain_id(),
                active
            )));
        }

        let rpc_url = self
            .registry
            .rpc_url(partner, self.infura_project_id.as_deref())
            .ok_or_else(|| BridgeError::Config(format!("no RPC endpoint for chain {}", partner)))?;
        debug!(partner, "Opening partner chain provider");
        // In-flight connects are allowed to finish; the token is re-checked at commit.
        let partner_provider = self.factory.connect(partner, &rpc_url).await?;

        let wallet_signer = ChainSigner {
            chain_id: active,
            account: account.clone(),
            provider: wallet,
            origin: SignerOrigin::Wallet,
        };
        let partner_signer = ChainSigner {
            chain_id: partner,
            account,
            provider: partner_provider,
            origin: SignerOrigin::PartnerRpc,
        };
        let (base, rollup) =
            ChainRole::of(&self.registry, active).assign(wallet_signer, partner_signer);
        let session = Arc::new(BridgeSession { chain_ids: pair, base, rollup });

        let attempt = self.attempt.lock();
        if token.is_cancelled() || attempt.token.is_cancelled() {
            return Err(BridgeError::SessionResolutionAborted);
        }
        self.session.send_replace(Some(session.clone()));
        Ok(session)
    }
}
