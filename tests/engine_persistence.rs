//! Engine restarts against a SQLite file.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rollup_bridge::blockchain::bridge::mock::{mock_receipt, MockMessageSource, MockProviderFactory};
use rollup_bridge::blockchain::bridge::{BridgeTxnStatus, BridgeTxnType, SessionInputs, TxDraft};
use rollup_bridge::core::config::EngineConfig;
use rollup_bridge::service::{BridgeEngine, EngineDeps};
use rollup_bridge::storage::BridgeStorage;
use std::sync::Arc;
use std::time::Duration;

async fn open(path: &std::path::Path) -> (BridgeEngine, Arc<MockProviderFactory>) {
    let url = format!("sqlite://{}", path.display());
    let storage = Arc::new(BridgeStorage::new_with_url(&url).await.unwrap());
    let factory = Arc::new(MockProviderFactory::new());
    let engine = BridgeEngine::new(
        &EngineConfig::default(),
        EngineDeps {
            provider_factory: factory.clone(),
            message_source: Arc::new(MockMessageSource::new()),
            reward_claimer: None,
            storage: Some(storage),
        },
    );
    (engine, factory)
}

#[tokio::test]
async fn test_confirmed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.db");

    {
        let (engine, factory) = open(&path).await;
        assert_eq!(engine.start().await.unwrap(), 0);
        let wallet = factory.provider(L1);
        engine.on_wallet_changed(SessionInputs::new(L1, ALICE, wallet.clone()));
        engine.submit(TxDraft::new(BridgeTxnType::Approve, L1, &hash(1), ALICE)).await.unwrap();
        engine.submit(TxDraft::new(BridgeTxnType::Approve, L1, &hash(2), BOB)).await.unwrap();
        wallet.set_receipt(mock_receipt(&hash(1), true, 77));

        let mut confirmed = false;
        for _ in 0..100 {
            engine.commands().refresh_now();
            if engine.read().status(L1, &hash(1)) == Some(BridgeTxnStatus::Confirmed) {
                confirmed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(confirmed);
        engine.shutdown().await;
    }

    let (engine, _) = open(&path).await;
    assert_eq!(engine.load().await.unwrap(), 2);
    let tx = engine.read().get(L1, &hash(1)).unwrap();
    assert_eq!(tx.status(), BridgeTxnStatus::Confirmed);
    assert_eq!(tx.block_number, Some(77));
    assert_eq!(engine.read().status(L1, &hash(2)), Some(BridgeTxnStatus::Pending));

    assert_eq!(engine.clear_history(BOB).await.unwrap().len(), 1);
    let (reopened, _) = open(&path).await;
    assert_eq!(reopened.load().await.unwrap(), 1);
}
