//! Wallet changes as seen by the poller and the reward reader.

mod common;

use common::*;
use rollup_bridge::blockchain::bridge::mock::{mock_receipt, MockRewardClaimer};
use rollup_bridge::blockchain::bridge::{
    BridgeTxnStatus, BridgeTxnType, PassReport, RewardReader, SessionInputs, SignerOrigin, TxDraft,
};
use rollup_bridge::blockchain::network::XDAI;
use rollup_bridge::core::config::PollerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_switching_to_rollup_keeps_both_chains_polled() {
    let b = connected_bridge(PollerConfig::default()).await;
    b.commands.submit(TxDraft::new(BridgeTxnType::Approve, L1, &hash(1), ALICE)).unwrap();
    b.commands.submit(TxDraft::new(BridgeTxnType::Approve, L2, &hash(2), ALICE)).unwrap();

    let session = b
        .sessions
        .set_inputs(SessionInputs::new(L2, ALICE, b.l2.clone()))
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.rollup.origin, SignerOrigin::Wallet);
    assert_eq!(session.base.origin, SignerOrigin::PartnerRpc);
    assert_eq!(session.base.chain_id, L1);

    b.l1.set_receipt(mock_receipt(&hash(1), true, 7));
    b.l2.set_receipt(mock_receipt(&hash(2), true, 8));
    let report = b.poller.run_pass().await;
    assert_eq!(report, PassReport { examined: 2, updated: 2, errors: 0 });
    assert_eq!(b.read.status(L1, &hash(1)), Some(BridgeTxnStatus::Confirmed));
    assert_eq!(b.read.status(L2, &hash(2)), Some(BridgeTxnStatus::Confirmed));
}

#[tokio::test]
async fn test_disconnect_pauses_polling_without_losing_records() {
    let b = connected_bridge(PollerConfig::default()).await;
    b.commands.submit(TxDraft::new(BridgeTxnType::Approve, L1, &hash(1), ALICE)).unwrap();
    b.l1.set_receipt(mock_receipt(&hash(1), true, 7));

    assert!(b.sessions.set_inputs(SessionInputs::disconnected()).is_none());
    assert!(b.sessions.current().is_none());
    assert_eq!(b.poller.run_pass().await, PassReport::default());
    assert_eq!(b.read.status(L1, &hash(1)), Some(BridgeTxnStatus::Pending));

    b.sessions
        .set_inputs(SessionInputs::new(L1, ALICE, b.l1.clone()))
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    b.poller.run_pass().await;
    assert_eq!(b.read.status(L1, &hash(1)), Some(BridgeTxnStatus::Confirmed));
}

#[tokio::test]
async fn test_unpaired_chain_clears_session() {
    let b = connected_bridge(PollerConfig::default()).await;
    let xdai = b.factory.provider(XDAI);
    assert!(b.sessions.set_inputs(SessionInputs::new(XDAI, ALICE, xdai)).is_none());
    assert!(b.sessions.current().is_none());

    let pair = b.sessions.chain_ids();
    assert_eq!(pair.active_chain_id, Some(XDAI));
    assert!(!pair.is_complete());
}

#[tokio::test]
async fn test_partner_outage_leaves_no_session() {
    let b = connected_bridge(PollerConfig::default()).await;
    b.factory.set_failing(true);
    let result = b
        .sessions
        .set_inputs(SessionInputs::new(L2, ALICE, b.l2.clone()))
        .unwrap()
        .await
        .unwrap();
    assert!(result.is_err());
    assert!(b.sessions.current().is_none());
}

#[tokio::test]
async fn test_reward_reader_follows_session_and_confirmation() {
    let b = connected_bridge(PollerConfig::default()).await;
    let claimer = Arc::new(MockRewardClaimer::new());
    claimer.set_claimed(ALICE, false);
    claimer.set_balance(ALICE, "4200");
    let rewards = RewardReader::new(Some(claimer.clone()), b.sessions.clone());

    assert!(!rewards.has_claimed(Some(ALICE)).await.value);
    assert_eq!(rewards.unclaimed_balance(Some(ALICE)).await.value, "4200");
    assert!(rewards.has_claimed(None).await.value);

    let cancel = CancellationToken::new();
    let mut watched = rewards.watch_claim(ALICE, cancel.clone());
    tokio::time::timeout(Duration::from_secs(5), watched.wait_for(|v| !v.loading))
        .await
        .unwrap()
        .unwrap();
    assert!(!watched.borrow().value);

    claimer.set_claimed(ALICE, true);
    for block in 10..110 {
        if watched.borrow().value {
            break;
        }
        b.l2.mine_block(block);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(watched.borrow().value);

    rewards.mark_claim_confirmed(ALICE);
    assert_eq!(rewards.unclaimed_balance(Some(ALICE)).await.value, "0");
    cancel.cancel();
}
