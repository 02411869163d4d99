//! Recurring reconciliation of open bridge legs against both chains.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resolver::MessageStateResolver;
use super::session::{BridgeSession, ChainSessionManager};
use super::store::{TransactionStore, UpsertOutcome};
use super::{now_millis, BridgeTxn, BridgeTxnType, OutgoingMessageState, RedeemState};
use crate::blockchain::network::NetworkRegistry;
use crate::blockchain::traits::ChainProvider;
use crate::core::config::{AutoRedeemPolicy, PollerConfig};
use crate::core::errors::BridgeError;

/// Outcome of one pass over the open records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub examined: usize,
    /// Upserts that changed the store.
    pub updated: usize,
    /// Records whose processing failed and will be retried next pass.
    pub errors: usize,
}

pub struct StatusPoller {
    store: Arc<TransactionStore>,
    sessions: ChainSessionManager,
    resolver: MessageStateResolver,
    registry: Arc<NetworkRegistry>,
    config: PollerConfig,
    refresh: Arc<Notify>,
}

impl StatusPoller {
    pub fn new(
        store: Arc<TransactionStore>,
        sessions: ChainSessionManager,
        resolver: MessageStateResolver,
        config: PollerConfig,
    ) -> Self {
        let registry = sessions.registry().clone();
        Self { store, sessions, resolver, registry, config, refresh: Arc::new(Notify::new()) }
    }

    /// Handle used by the command surface to request an out-of-cycle pass.
    pub fn refresh_handle(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    /// Runs until `cancel` fires. A pass starts on each interval tick, each new
    /// block on either session chain, each session change and each refresh
    /// request; triggers closer than `min_pass_interval` apart share one pass.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut sessions = self.sessions.subscribe();
        let mut blocks = block_receivers(sessions.borrow_and_update().as_deref());
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_pass: Option<Instant> = None;

        info!(interval = ?self.config.poll_interval(), "Status poller started");
        loop {
            let mut forced = false;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.refresh.notified() => forced = true,
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    blocks = block_receivers(sessions.borrow_and_update().as_deref());
                }
                _ = next_block(&mut blocks) => {}
            }

            if let (Some(last), false) = (last_pass, forced) {
                let wait = self.config.min_pass_interval().saturating_sub(last.elapsed());
                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }

            let report = self.run_pass().await;
            last_pass = Some(Instant::now());
            if report.examined > 0 {
                debug!(
                    examined = report.examined,
                    updated = report.updated,
                    errors = report.errors,
                    "Poll pass complete"
                );
            }
        }
        info!("Status poller stopped");
    }

    /// One pass over every open record on the current session's chains.
    /// A failing record is counted and logged; it never stops the others.
    pub async fn run_pass(&self) -> PassReport {
        let Some(session) = self.sessions.current() else {
            debug!("No bridge session; skipping pass");
            return PassReport::default();
        };

        let open: Vec<BridgeTxn> = self
            .store
            .open_records()
            .into_iter()
            .filter(|tx| session.provider_for(tx.chain_id).is_some())
            .collect();
        let mut report = PassReport { examined: open.len(), ..PassReport::default() };

        let results: Vec<_> = stream::iter(open)
            .map(|tx| {
                let session = session.clone();
                async move {
                    let key = tx.key();
                    (key, self.process(&session, tx).await)
                }
            })
            .buffer_unordered(self.config.max_concurrent_queries.max(1))
            .collect()
            .await;

        for (key, result) in results {
            match result {
                Ok(n) => report.updated += n,
                Err(e) => {
                    report.errors += 1;
                    warn!(key = %key, retryable = e.is_retryable(), "Record update failed: {}", e);
                }
            }
        }
        report
    }

    async fn process(&self, session: &BridgeSession, tx: BridgeTxn) -> Result<usize, BridgeError> {
        let provider = session
            .provider_for(tx.chain_id)
            .ok_or_else(|| BridgeError::NotFound(format!("no provider for chain {}", tx.chain_id)))?;
        let mut updated = 0;

        let tx = if tx.receipt.is_none() {
            match self.fetch_receipt(provider.as_ref(), &tx).await? {
                Some(patch) => {
                    updated += self.apply(patch.clone());
                    self.store.get_key(&tx.key()).unwrap_or(patch)
                }
                None => return Ok(updated + self.check_dropped(&tx)),
            }
        } else {
            tx
        };

        if tx.receipt_succeeded() == Some(false) && tx.tx_type != BridgeTxnType::DepositL2 {
            return Ok(updated);
        }

        updated += match tx.tx_type {
            BridgeTxnType::Withdraw => self.advance_withdrawal(session, &tx).await?,
            BridgeTxnType::DepositL1 if tx.partner_tx_hash.is_none() => {
                self.derive_deposit(provider.as_ref(), &tx).await?
            }
            BridgeTxnType::DepositL2 => self.track_retryable(session, &tx).await?,
            BridgeTxnType::Outbox => self.finalize_withdrawal(&tx),
            BridgeTxnType::DepositL2AutoRedeem => self.settle_redeemed(&tx),
            _ => 0,
        };
        Ok(updated)
    }

    /// `Ok(None)` while pending, including when the query outlives its bounded wait.
    async fn fetch_receipt(
        &self,
        provider: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<Option<BridgeTxn>, BridgeError> {
        let query = provider.get_transaction_receipt(&tx.tx_hash);
        let receipt = match tokio::time::timeout(self.config.receipt_timeout(), query).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(key = %tx.key(), "Receipt query timed out; still pending");
                return Ok(None);
            }
        };
        let Some(receipt) = receipt else {
            return Ok(None);
        };

        let mut patch = tx.clone();
        patch.block_number = receipt.block_number.map(|b| b.as_u64());
        patch.timestamp_resolved = Some(now_millis());
        patch.receipt = Some(receipt);
        if patch.receipt_succeeded() == Some(false) {
            info!(key = %tx.key(), tx_type = %tx.tx_type, "Transaction reverted");
        }
        Ok(Some(patch))
    }

    fn check_dropped(&self, tx: &BridgeTxn) -> usize {
        let age_ms = now_millis().saturating_sub(tx.timestamp_created);
        if age_ms < 0 || (age_ms as u128) < self.config.max_wait().as_millis() {
            return 0;
        }
        warn!(key = %tx.key(), age_ms, "No receipt within the wait horizon; marking dropped");
        let mut patch = tx.clone();
        patch.dropped = true;
        self.apply(patch)
    }

    async fn advance_withdrawal(
        &self,
        session: &BridgeSession,
        tx: &BridgeTxn,
    ) -> Result<usize, BridgeError> {
        let mut updated = 0;
        let mut tx = tx.clone();

        if tx.message_ref().is_empty() {
            let rollup = self.provider(session, tx.chain_id)?;
            let Some(message) = self.resolver.withdrawal_coordinates(rollup.as_ref(), &tx).await? else {
                debug!(key = %tx.key(), "Withdrawal message not yet indexed");
                return Ok(0);
            };
            let mut patch = tx.clone();
            patch.seq_num = message.seq_num;
            patch.batch_number = message.batch_number;
            patch.batch_index = message.batch_index;
            updated += self.apply(patch.clone());
            tx = self.store.get_key(&tx.key()).unwrap_or(patch);
        }

        let base_chain = self.partner_chain(tx.chain_id)?;
        let base = self.provider(session, base_chain)?;
        if let Some(state) = self.resolver.outgoing_state(base.as_ref(), &tx).await? {
            let mut patch = tx.clone();
            patch.outgoing_message_state = Some(state);
            updated += self.apply(patch);
        }
        Ok(updated)
    }

    async fn derive_deposit(
        &self,
        base: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<usize, BridgeError> {
        let Some(message) = self.resolver.deposit_message(base, tx).await? else {
            return Ok(0);
        };
        let rollup_chain = self.partner_chain(tx.chain_id)?;

        let l2 = BridgeTxn::new(BridgeTxnType::DepositL2, rollup_chain, &message.retryable_tx_hash, &tx.sender)
            .with_asset(&tx.asset_name, tx.asset_type, &tx.value)
            .with_seq_num(message.seq_num)
            .with_partner(&tx.tx_hash);
        let mut patch = tx.clone();
        patch.seq_num = Some(message.seq_num);
        patch.partner_tx_hash = Some(l2.tx_hash.clone());

        // Child first so a settled deposit-l1 always has its deposit-l2 in the store.
        Ok(self.apply(l2) + self.apply(patch))
    }

    async fn track_retryable(
        &self,
        session: &BridgeSession,
        tx: &BridgeTxn,
    ) -> Result<usize, BridgeError> {
        let rollup = self.provider(session, tx.chain_id)?;
        let mut updated = 0;
        let mut tx = tx.clone();
        if let Some(state) = self.resolver.redeem_state(rollup.as_ref(), &tx).await? {
            let mut patch = tx.clone();
            patch.redeem_state = Some(state);
            updated += self.apply(patch.clone());
            tx = self.store.get_key(&tx.key()).unwrap_or(patch);
        }

        if !MessageStateResolver::needs_redeem(&tx) {
            return Ok(updated);
        }
        if self.config.auto_redeem == AutoRedeemPolicy::Manual {
            debug!(key = %tx.key(), "Redeem required; waiting for manual submission");
            return Ok(updated);
        }
        updated += self.synthesize_auto_redeem(session, &tx).await?;
        Ok(updated)
    }

    /// The auto-redeem hash comes from the originating deposit-l1 message.
    async fn synthesize_auto_redeem(
        &self,
        session: &BridgeSession,
        l2: &BridgeTxn,
    ) -> Result<usize, BridgeError> {
        let (Some(l1_hash), Ok(base_chain)) = (l2.partner_tx_hash.as_deref(), self.partner_chain(l2.chain_id))
        else {
            return Ok(0);
        };
        let Some(l1) = self.store.get(base_chain, l1_hash) else {
            return Ok(0);
        };
        let base = self.provider(session, base_chain)?;
        let Some(message) = self.resolver.deposit_message(base.as_ref(), &l1).await? else {
            return Ok(0);
        };

        let redeem = BridgeTxn::new(
            BridgeTxnType::DepositL2AutoRedeem,
            l2.chain_id,
            &message.auto_redeem_tx_hash,
            &l2.sender,
        )
        .with_asset(&l2.asset_name, l2.asset_type, &l2.value)
        .with_seq_num(message.seq_num)
        .with_partner(&l2.tx_hash);
        Ok(self.apply(redeem))
    }

    /// A confirmed outbox leg executes its partner withdrawal.
    fn finalize_withdrawal(&self, outbox: &BridgeTxn) -> usize {
        let (Some(partner), Ok(rollup_chain)) = (outbox.partner_tx_hash.as_deref(), self.partner_chain(outbox.chain_id))
        else {
            return 0;
        };
        let Some(mut withdrawal) = self.store.get(rollup_chain, partner) else {
            debug!(key = %outbox.key(), "Outbox partner withdrawal not tracked");
            return 0;
        };
        withdrawal.outgoing_message_state = Some(OutgoingMessageState::Executed);
        self.apply(withdrawal)
    }

    /// A confirmed auto-redeem leg redeems its partner deposit-l2.
    fn settle_redeemed(&self, redeem: &BridgeTxn) -> usize {
        let Some(partner) = redeem.partner_tx_hash.as_deref() else {
            return 0;
        };
        let Some(mut l2) = self.store.get(redeem.chain_id, partner) else {
            debug!(key = %redeem.key(), "Auto-redeem partner deposit not tracked");
            return 0;
        };
        l2.redeem_state = Some(RedeemState::Redeemed);
        self.apply(l2)
    }

    fn apply(&self, patch: BridgeTxn) -> usize {
        let key = patch.key();
        match self.store.upsert(patch) {
            UpsertOutcome::Unchanged => 0,
            outcome => {
                if let Some(tx) = self.store.get_key(&key) {
                    info!(
                        key = %key,
                        tx_type = %tx.tx_type,
                        status = ?tx.status(),
                        message_state = ?tx.outgoing_message_state,
                        redeem_state = ?tx.redeem_state,
                        ?outcome,
                        "Bridge transaction updated"
                    );
                }
                1
            }
        }
    }

    fn partner_chain(&self, chain_id: u64) -> Result<u64, BridgeError> {
        self.registry
            .partner_of(chain_id)
            .ok_or_else(|| BridgeError::NotFound(format!("no partner chain for {}", chain_id)))
    }

    fn provider(
        &self,
        session: &BridgeSession,
        chain_id: u64,
    ) -> Result<Arc<dyn ChainProvider>, BridgeError> {
        session
            .provider_for(chain_id)
            .ok_or_else(|| BridgeError::NotFound(format!("chain {} is not in the session", chain_id)))
    }
}

fn block_receivers(session: Option<&BridgeSession>) -> Vec<watch::Receiver<u64>> {
    session
        .map(|s| vec![s.base.provider.subscribe_blocks(), s.rollup.provider.subscribe_blocks()])
        .unwrap_or_default()
}

/// Resolves when any receiver sees a new block. Closed channels are dropped;
/// with none left this never resolves.
async fn next_block(blocks: &mut Vec<watch::Receiver<u64>>) {
    loop {
        if blocks.is_empty() {
            return std::future::pending().await;
        }
        let (result, index, _) =
            futures::future::select_all(blocks.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
        match result {
            Ok(()) => return,
            Err(_) => {
                blocks.swap_remove(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{mock_receipt, MockChainProvider, MockMessageSource, MockProviderFactory};
    use super::super::session::SessionInputs;
    use super::super::test_support::*;
    use super::super::{BridgeTxnStatus, MessageRef, WithdrawalPhase};
    use super::*;
    use crate::blockchain::traits::{DepositMessage, RetryableStatus};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const L1: u64 = 1;
    const L2: u64 = 42161;

    struct Harness {
        store: Arc<TransactionStore>,
        source: Arc<MockMessageSource>,
        l1: Arc<MockChainProvider>,
        l2: Arc<MockChainProvider>,
        poller: Arc<StatusPoller>,
    }

    async fn harness(config: PollerConfig) -> Harness {
        let factory = Arc::new(MockProviderFactory::new());
        let sessions =
            ChainSessionManager::new(Arc::new(NetworkRegistry::default()), factory.clone(), None);
        let l1 = factory.provider(L1);
        let l2 = factory.provider(L2);
        sessions
            .set_inputs(SessionInputs::new(L1, ALICE, l1.clone()))
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        let store = Arc::new(TransactionStore::new());
        let source = Arc::new(MockMessageSource::new());
        let poller = Arc::new(StatusPoller::new(
            store.clone(),
            sessions,
            MessageStateResolver::new(source.clone()),
            config,
        ));
        Harness { store, source, l1, l2, poller }
    }

    #[tokio::test]
    async fn test_receipt_arrival_confirms_deposit() {
        let h = harness(PollerConfig::default()).await;
        let tx = BridgeTxn::new(BridgeTxnType::DepositL1, L1, &hash(0xaa), ALICE)
            .with_asset("ETH", super::super::BridgeAssetType::Native, "1000000000000000000");
        h.store.upsert(tx);

        let report = h.poller.run_pass().await;
        assert_eq!(report, PassReport { examined: 1, updated: 0, errors: 0 });
        assert_eq!(h.store.get(L1, &hash(0xaa)).unwrap().status(), BridgeTxnStatus::Pending);

        h.l1.set_receipt(mock_receipt(&hash(0xaa), true, 100));
        h.poller.run_pass().await;
        let stored = h.store.get(L1, &hash(0xaa)).unwrap();
        assert_eq!(stored.status(), BridgeTxnStatus::Confirmed);
        assert_eq!(stored.block_number, Some(100));
        assert!(stored.timestamp_resolved.is_some());
    }

    #[tokio::test]
    async fn test_failed_receipt_is_failure() {
        let h = harness(PollerConfig::default()).await;
        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE));
        h.l1.set_receipt(mock_receipt(&hash(1), false, 5));
        h.poller.run_pass().await;
        let stored = h.store.get(L1, &hash(1)).unwrap();
        assert_eq!(stored.status(), BridgeTxnStatus::Failure);
        assert!(h.store.open_records().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_does_not_abort_pass() {
        let h = harness(PollerConfig::default()).await;
        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE));
        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L2, &hash(2), ALICE));
        h.l1.set_failing(true);
        h.l2.set_receipt(mock_receipt(&hash(2), true, 5));

        let report = h.poller.run_pass().await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(h.store.get(L1, &hash(1)).unwrap().status(), BridgeTxnStatus::Pending);

        h.l1.set_failing(false);
        h.l1.set_receipt(mock_receipt(&hash(1), true, 6));
        assert_eq!(h.poller.run_pass().await.errors, 0);
        assert_eq!(h.store.get(L1, &hash(1)).unwrap().status(), BridgeTxnStatus::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_receipt_query_stays_pending() {
        let h = harness(PollerConfig::default()).await;
        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE));
        h.l1.set_receipt(mock_receipt(&hash(1), true, 5));
        h.l1.set_receipt_delay(Some(Duration::from_secs(60)));

        let report = h.poller.run_pass().await;
        assert_eq!(report.errors, 0);
        assert_eq!(h.store.get(L1, &hash(1)).unwrap().status(), BridgeTxnStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_receipt_past_horizon_is_dropped() {
        let config = PollerConfig { max_wait_secs: 60, ..PollerConfig::default() };
        let h = harness(config).await;
        let old = BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE)
            .created_at(now_millis() - 61_000);
        let fresh = BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(2), ALICE);
        h.store.upsert(old);
        h.store.upsert(fresh);

        h.poller.run_pass().await;
        let old = h.store.get(L1, &hash(1)).unwrap();
        assert!(old.dropped);
        assert_eq!(old.status(), BridgeTxnStatus::Failure);
        assert!(!h.store.get(L1, &hash(2)).unwrap().dropped);
    }

    #[tokio::test]
    async fn test_withdrawal_walks_through_phases() {
        let h = harness(PollerConfig::default()).await;
        let w = BridgeTxn::new(BridgeTxnType::Withdraw, L2, &hash(0x10), ALICE);
        h.store.upsert(w);
        h.l2.set_receipt(mock_receipt(&hash(0x10), true, 50));
        let msg = MessageRef { seq_num: Some(42), ..Default::default() };
        h.source.set_withdrawal_message(&hash(0x10), msg.clone());

        h.poller.run_pass().await;
        let stored = h.store.get(L2, &hash(0x10)).unwrap();
        assert_eq!(stored.seq_num, Some(42));
        assert_eq!(stored.withdrawal_phase(), Some(WithdrawalPhase::DisputePeriod));

        h.source.set_outgoing_state(&msg, OutgoingMessageState::Confirmed);
        h.poller.run_pass().await;
        let stored = h.store.get(L2, &hash(0x10)).unwrap();
        assert_eq!(stored.withdrawal_phase(), Some(WithdrawalPhase::Executable));

        // Outbox execution confirmed on L1 executes the partner.
        h.store.upsert(BridgeTxn::new(BridgeTxnType::Outbox, L1, &hash(0x11), ALICE).with_partner(&hash(0x10)));
        h.l1.set_receipt(mock_receipt(&hash(0x11), true, 200));
        h.poller.run_pass().await;
        let stored = h.store.get(L2, &hash(0x10)).unwrap();
        assert_eq!(stored.outgoing_message_state, Some(OutgoingMessageState::Executed));
        assert!(h.store.open_records().is_empty());
    }

    #[tokio::test]
    async fn test_message_query_failure_keeps_prior_state() {
        let h = harness(PollerConfig::default()).await;
        let mut w = BridgeTxn::new(BridgeTxnType::Withdraw, L2, &hash(3), ALICE).with_seq_num(7);
        w.receipt = Some(receipt(true, 1));
        w.outgoing_message_state = Some(OutgoingMessageState::Unconfirmed);
        h.store.upsert(w);
        h.source.set_failing(true);

        let report = h.poller.run_pass().await;
        assert_eq!(report.errors, 1);
        assert_eq!(
            h.store.get(L2, &hash(3)).unwrap().outgoing_message_state,
            Some(OutgoingMessageState::Unconfirmed)
        );
    }

    fn deposit_message() -> DepositMessage {
        DepositMessage { seq_num: 77, retryable_tx_hash: hash(0x21), auto_redeem_tx_hash: hash(0x22) }
    }

    #[tokio::test]
    async fn test_deposit_l1_spawns_deposit_l2() {
        let h = harness(PollerConfig::default()).await;
        h.store.upsert(
            BridgeTxn::new(BridgeTxnType::DepositL1, L1, &hash(0x20), ALICE)
                .with_asset("USDC", super::super::BridgeAssetType::Token, "5000000"),
        );
        h.l1.set_receipt(mock_receipt(&hash(0x20), true, 10));
        h.source.set_deposit_message(&hash(0x20), deposit_message());

        h.poller.run_pass().await;
        let l1 = h.store.get(L1, &hash(0x20)).unwrap();
        assert_eq!(l1.partner_tx_hash, Some(hash(0x21)));
        assert_eq!(l1.seq_num, Some(77));
        let l2 = h.store.get(L2, &hash(0x21)).unwrap();
        assert_eq!(l2.tx_type, BridgeTxnType::DepositL2);
        assert_eq!(l2.partner_tx_hash, Some(hash(0x20)));
        assert_eq!(l2.asset_name, "USDC");
        assert_eq!(l2.value, "5000000");
    }

    async fn failed_deposit_l2(policy: AutoRedeemPolicy) -> Harness {
        let h = harness(PollerConfig { auto_redeem: policy, ..PollerConfig::default() }).await;
        let mut l1 = BridgeTxn::new(BridgeTxnType::DepositL1, L1, &hash(0x20), ALICE)
            .with_partner(&hash(0x21))
            .with_seq_num(77);
        l1.receipt = Some(mock_receipt(&hash(0x20), true, 10));
        h.store.upsert(l1);
        h.store.upsert(
            BridgeTxn::new(BridgeTxnType::DepositL2, L2, &hash(0x21), ALICE)
                .with_seq_num(77)
                .with_partner(&hash(0x20)),
        );
        h.source.set_deposit_message(&hash(0x20), deposit_message());
        h.l2.set_receipt(mock_receipt(&hash(0x21), true, 11));
        h.source.set_retryable_status(77, RetryableStatus::FundsDepositedOnL2);
        h
    }

    #[tokio::test]
    async fn test_required_redeem_synthesizes_auto_redeem() {
        let h = failed_deposit_l2(AutoRedeemPolicy::Automatic).await;
        h.poller.run_pass().await;

        let l2 = h.store.get(L2, &hash(0x21)).unwrap();
        assert_eq!(l2.redeem_state, Some(RedeemState::Required));
        let redeem = h.store.get(L2, &hash(0x22)).unwrap();
        assert_eq!(redeem.tx_type, BridgeTxnType::DepositL2AutoRedeem);
        assert_eq!(redeem.partner_tx_hash, Some(hash(0x21)));

        // Re-deriving is idempotent.
        let before = h.store.len();
        h.poller.run_pass().await;
        assert_eq!(h.store.len(), before);

        h.source.set_retryable_status(77, RetryableStatus::Redeemed);
        h.l2.set_receipt(mock_receipt(&hash(0x22), true, 12));
        h.poller.run_pass().await;
        assert_eq!(h.store.get(L2, &hash(0x21)).unwrap().redeem_state, Some(RedeemState::Redeemed));
        assert!(h.store.open_records().is_empty());
    }

    #[tokio::test]
    async fn test_failed_deposit_l2_settles_once_auto_redeem_confirms() {
        let h = failed_deposit_l2(AutoRedeemPolicy::Automatic).await;
        h.l2.set_receipt(mock_receipt(&hash(0x21), false, 11));
        h.source.set_retryable_status(77, RetryableStatus::NotYetCreated);
        h.poller.run_pass().await;
        assert_eq!(h.store.get(L2, &hash(0x21)).unwrap().redeem_state, Some(RedeemState::Required));
        assert!(h.store.get(L2, &hash(0x22)).is_some());

        h.l2.set_receipt(mock_receipt(&hash(0x22), true, 12));
        h.poller.run_pass().await;
        let l2 = h.store.get(L2, &hash(0x21)).unwrap();
        assert_eq!(l2.redeem_state, Some(RedeemState::Redeemed));
        assert_eq!(l2.status(), BridgeTxnStatus::Failure);
        assert!(h.store.open_records().is_empty());

        let queries = h.source.queries();
        for _ in 0..3 {
            assert_eq!(h.poller.run_pass().await.examined, 0);
        }
        assert_eq!(h.source.queries(), queries);
    }

    #[tokio::test]
    async fn test_failed_deposit_l2_picks_up_expiry() {
        let h = failed_deposit_l2(AutoRedeemPolicy::Manual).await;
        h.l2.set_receipt(mock_receipt(&hash(0x21), false, 11));
        h.poller.run_pass().await;
        assert_eq!(h.store.open_records().len(), 1);

        h.source.set_retryable_status(77, RetryableStatus::Expired);
        h.poller.run_pass().await;
        assert_eq!(h.store.get(L2, &hash(0x21)).unwrap().redeem_state, Some(RedeemState::Expired));
        assert!(h.store.open_records().is_empty());
    }

    #[tokio::test]
    async fn test_manual_policy_only_flags() {
        let h = failed_deposit_l2(AutoRedeemPolicy::Manual).await;
        h.poller.run_pass().await;
        assert_eq!(h.store.get(L2, &hash(0x21)).unwrap().redeem_state, Some(RedeemState::Required));
        assert!(h.store.get(L2, &hash(0x22)).is_none());
    }

    #[tokio::test]
    async fn test_no_session_means_empty_pass() {
        let factory = Arc::new(MockProviderFactory::new());
        let sessions = ChainSessionManager::new(Arc::new(NetworkRegistry::default()), factory, None);
        let store = Arc::new(TransactionStore::new());
        store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE));
        let poller = StatusPoller::new(
            store,
            sessions,
            MessageStateResolver::new(Arc::new(MockMessageSource::new())),
            PollerConfig::default(),
        );
        assert_eq!(poller.run_pass().await, PassReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_follows_blocks_and_refresh() {
        let h = harness(PollerConfig::default()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.poller.clone().run(cancel.clone()));

        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L1, &hash(1), ALICE));
        h.l1.set_receipt(mock_receipt(&hash(1), true, 1));
        h.l1.mine_block(1);
        for _ in 0..50 {
            if h.store.get(L1, &hash(1)).unwrap().receipt.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(h.store.get(L1, &hash(1)).unwrap().status(), BridgeTxnStatus::Confirmed);

        h.store.upsert(BridgeTxn::new(BridgeTxnType::Approve, L2, &hash(2), ALICE));
        h.l2.set_receipt(mock_receipt(&hash(2), true, 1));
        h.poller.refresh_handle().notify_one();
        for _ in 0..50 {
            if h.store.get(L2, &hash(2)).unwrap().receipt.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(h.store.get(L2, &hash(2)).unwrap().status(), BridgeTxnStatus::Confirmed);

        cancel.cancel();
        task.await.unwrap();
    }
}
