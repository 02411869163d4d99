#![allow(dead_code)]

use rollup_bridge::blockchain::bridge::mock::{MockChainProvider, MockMessageSource, MockProviderFactory};
use rollup_bridge::blockchain::bridge::{
    ChainSessionManager, CommandApi, DismissedSet, MessageStateResolver, ReadApi, SessionInputs,
    StatusPoller, TransactionStore,
};
use rollup_bridge::blockchain::network::{NetworkRegistry, ARBITRUM_ONE, ETHEREUM_MAINNET};
use rollup_bridge::core::config::PollerConfig;
use std::sync::Arc;

pub const L1: u64 = ETHEREUM_MAINNET;
pub const L2: u64 = ARBITRUM_ONE;
pub const ALICE: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";
pub const BOB: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

pub fn hash(n: u8) -> String {
    format!("0x{}", hex::encode([n; 32]))
}

/// Store, session, poller and both API surfaces wired over mocks, with the
/// wallet connected to `L1` as `ALICE`.
pub struct Bridge {
    pub store: Arc<TransactionStore>,
    pub sessions: ChainSessionManager,
    pub source: Arc<MockMessageSource>,
    pub factory: Arc<MockProviderFactory>,
    pub l1: Arc<MockChainProvider>,
    pub l2: Arc<MockChainProvider>,
    pub poller: Arc<StatusPoller>,
    pub commands: CommandApi,
    pub read: ReadApi,
}

pub async fn connected_bridge(config: PollerConfig) -> Bridge {
    let registry = Arc::new(NetworkRegistry::default());
    let factory = Arc::new(MockProviderFactory::new());
    let sessions = ChainSessionManager::new(registry.clone(), factory.clone(), None);
    let l1 = factory.provider(L1);
    let l2 = factory.provider(L2);
    sessions
        .set_inputs(SessionInputs::new(L1, ALICE, l1.clone()))
        .expect("session task")
        .await
        .expect("join")
        .expect("session");

    let store = Arc::new(TransactionStore::new());
    let source = Arc::new(MockMessageSource::new());
    let poller = Arc::new(StatusPoller::new(
        store.clone(),
        sessions.clone(),
        MessageStateResolver::new(source.clone()),
        config,
    ));
    let dismissed = DismissedSet::default();
    let commands = CommandApi::new(store.clone(), registry.clone(), dismissed.clone(), poller.refresh_handle());
    let read = ReadApi::new(store.clone(), registry, dismissed);
    Bridge { store, sessions, source, factory, l1, l2, poller, commands, read }
}
