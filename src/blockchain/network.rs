//! Static network-detail registry: chain id -> role, partner chain and RPC endpoints.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ETHEREUM_MAINNET: u64 = 1;
pub const RINKEBY: u64 = 4;
pub const XDAI: u64 = 100;
pub const ARBITRUM_ONE: u64 = 42161;
pub const ARBITRUM_RINKEBY: u64 = 421611;

/// One chain's entry in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkDetail {
    pub chain_id: u64,
    pub name: String,
    /// True for rollup (L2) chains.
    #[serde(default)]
    pub is_rollup: bool,
    /// The chain on the other side of the bridge, if any.
    #[serde(default)]
    pub partner_chain_id: Option<u64>,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
}

lazy_static! {
    static ref DEFAULT_NETWORKS: Vec<NetworkDetail> = vec![
        NetworkDetail {
            chain_id: ETHEREUM_MAINNET,
            name: "Ethereum Mainnet".to_string(),
            is_rollup: false,
            partner_chain_id: Some(ARBITRUM_ONE),
            rpc_urls: vec!["https://mainnet.infura.io/v3".to_string()],
        },
        NetworkDetail {
            chain_id: ARBITRUM_ONE,
            name: "Arbitrum One".to_string(),
            is_rollup: true,
            partner_chain_id: Some(ETHEREUM_MAINNET),
            rpc_urls: vec!["https://arb1.arbitrum.io/rpc".to_string()],
        },
        NetworkDetail {
            chain_id: RINKEBY,
            name: "Rinkeby".to_string(),
            is_rollup: false,
            partner_chain_id: Some(ARBITRUM_RINKEBY),
            rpc_urls: vec!["https://rinkeby.infura.io/v3".to_string()],
        },
        NetworkDetail {
            chain_id: ARBITRUM_RINKEBY,
            name: "Arbitrum Rinkeby".to_string(),
            is_rollup: true,
            partner_chain_id: Some(RINKEBY),
            rpc_urls: vec!["https://rinkeby.arbitrum.io/rpc".to_string()],
        },
        NetworkDetail {
            chain_id: XDAI,
            name: "xDai".to_string(),
            is_rollup: false,
            partner_chain_id: None,
            rpc_urls: vec!["https://rpc.xdaichain.com".to_string()],
        },
    ];
}

/// Lookup table consulted by the session manager and the command surface.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: HashMap<u64, NetworkDetail>,
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::from_details(DEFAULT_NETWORKS.iter().cloned())
    }
}

impl NetworkRegistry {
    pub fn from_details(details: impl IntoIterator<Item = NetworkDetail>) -> Self {
        let networks = details.into_iter().map(|d| (d.chain_id, d)).collect();
        Self { networks }
    }

    /// Built-in table unless `overrides` is non-empty.
    pub fn with_overrides(overrides: &[NetworkDetail]) -> Self {
        if overrides.is_empty() {
            Self::default()
        } else {
            Self::from_details(overrides.iter().cloned())
        }
    }

    pub fn get(&self, chain_id: u64) -> Option<&NetworkDetail> {
        self.networks.get(&chain_id)
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.networks.contains_key(&chain_id)
    }

    pub fn partner_of(&self, chain_id: u64) -> Option<u64> {
        self.get(chain_id).and_then(|d| d.partner_chain_id)
    }

    pub fn is_rollup(&self, chain_id: u64) -> bool {
        self.get(chain_id).map(|d| d.is_rollup).unwrap_or(false)
    }

    /// First RPC endpoint of `chain_id`, with the infura key applied.
    pub fn rpc_url(&self, chain_id: u64, infura_project_id: Option<&str>) -> Option<String> {
        let url = self.get(chain_id)?.rpc_urls.first()?;
        Some(match infura_project_id {
            Some(id) => add_infura_key(url, id),
            None => url.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// Infura endpoints need the project id appended as the last path segment.
pub fn add_infura_key(rpc_url: &str, project_id: &str) -> String {
    if !rpc_url.contains("infura") {
        return rpc_url.to_string();
    }
    let mut url = rpc_url.to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    url.push_str(project_id);
    url
}
