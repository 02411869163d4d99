//! Read surface for wallet front ends: filtered lists, per-transfer summaries
//! and reward-claim reads.

use serde::{Deserialize, Serialize};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::commands::DismissedSet;
use super::session::{BridgeSession, ChainSessionManager};
use super::store::{StoreSubscriber, SubscriptionId, TransactionStore, TxFilter};
use super::{BridgeAssetType, BridgeTxn, BridgeTxnStatus, BridgeTxnType, TxKey, WithdrawalPhase};
use crate::blockchain::network::NetworkRegistry;
use crate::blockchain::traits::RewardClaimer;

/// A value that may still be loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loadable<T> {
    pub loading: bool,
    pub value: T,
}

impl<T> Loadable<T> {
    pub fn ready(value: T) -> Self {
        Self { loading: false, value }
    }

    pub fn loading(value: T) -> Self {
        Self { loading: true, value }
    }
}

/// One logical transfer assembled from legs linked by `partnerTxHash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub asset_name: String,
    pub asset_type: BridgeAssetType,
    pub value: String,
    pub from_chain_id: u64,
    pub to_chain_id: Option<u64>,
    /// Status of the latest leg.
    pub status: BridgeTxnStatus,
    pub withdrawal_phase: Option<WithdrawalPhase>,
    pub legs: Vec<TxKey>,
    pub timestamp_created: i64,
    pub timestamp_resolved: Option<i64>,
}

/// Legs that continue an earlier leg and point back to it.
fn is_follow_up(tx_type: &BridgeTxnType) -> bool {
    matches!(
        tx_type,
        BridgeTxnType::DepositL2 | BridgeTxnType::DepositL2AutoRedeem | BridgeTxnType::Outbox
    )
}

#[derive(Clone)]
pub struct ReadApi {
    store: Arc<TransactionStore>,
    registry: Arc<NetworkRegistry>,
    dismissed: DismissedSet,
}

impl ReadApi {
    pub fn new(store: Arc<TransactionStore>, registry: Arc<NetworkRegistry>, dismissed: DismissedSet) -> Self {
        Self { store, registry, dismissed }
    }

    /// Newest first. Dismissed records are skipped unless the filter asks for them.
    pub fn list(&self, filter: &TxFilter) -> Vec<BridgeTxn> {
        let mut records = self.store.list(filter);
        if !filter.include_dismissed {
            let dismissed = self.dismissed.read();
            records.retain(|tx| !dismissed.contains(&tx.key()));
        }
        records
    }

    pub fn get(&self, chain_id: u64, tx_hash: &str) -> Option<BridgeTxn> {
        self.store.get(chain_id, tx_hash)
    }

    pub fn status(&self, chain_id: u64, tx_hash: &str) -> Option<BridgeTxnStatus> {
        self.get(chain_id, tx_hash).map(|tx| tx.status())
    }

    pub fn withdrawal_phase(&self, chain_id: u64, tx_hash: &str) -> Option<WithdrawalPhase> {
        self.get(chain_id, tx_hash).and_then(|tx| tx.withdrawal_phase())
    }

    pub fn is_dismissed(&self, chain_id: u64, tx_hash: &str) -> bool {
        self.dismissed.read().contains(&TxKey::new(chain_id, tx_hash))
    }

    /// Visible legs of `account` still waiting for a receipt.
    pub fn pending_count(&self, account: &str) -> usize {
        self.list(&TxFilter::account(account))
            .iter()
            .filter(|tx| tx.status() == BridgeTxnStatus::Pending)
            .count()
    }

    pub fn transfer_summaries(&self, account: &str) -> Vec<TransferSummary> {
        let records = self.list(&TxFilter::account(account));
        let hashes: HashSet<&str> = records.iter().map(|tx| tx.tx_hash.as_str()).collect();

        let mut children: HashMap<&str, Vec<&BridgeTxn>> = HashMap::new();
        let mut roots = Vec::new();
        for tx in &records {
            match tx.partner_tx_hash.as_deref() {
                Some(parent) if is_follow_up(&tx.tx_type) && hashes.contains(parent) => {
                    children.entry(parent).or_default().push(tx)
                }
                _ => roots.push(tx),
            }
        }
        for legs in children.values_mut() {
            legs.sort_by_key(|tx| tx.timestamp_created);
        }

        roots
            .into_iter()
            .map(|root| {
                let mut legs = vec![root];
                let mut i = 0;
                while i < legs.len() {
                    if let Some(next) = children.get(legs[i].tx_hash.as_str()) {
                        legs.extend(next.iter().copied());
                    }
                    i += 1;
                }
                let last = legs[legs.len() - 1];
                TransferSummary {
                    asset_name: root.asset_name.clone(),
                    asset_type: root.asset_type,
                    value: root.value.clone(),
                    from_chain_id: root.chain_id,
                    to_chain_id: self.registry.partner_of(root.chain_id),
                    status: last.status(),
                    withdrawal_phase: root.withdrawal_phase(),
                    legs: legs.iter().map(|tx| tx.key()).collect(),
                    timestamp_created: root.timestamp_created,
                    timestamp_resolved: last.timestamp_resolved,
                }
            })
            .collect()
    }

    pub fn subscribe<S>(&self, filter: TxFilter, subscriber: S) -> SubscriptionId
    where
        S: StoreSubscriber + 'static,
    {
        self.store.subscribe(filter, subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }
}

/// Reward-claim reads. Any missing input yields the safe answer
/// (`claimed = true`, nothing claimable) without touching the contract.
#[derive(Clone)]
pub struct RewardReader {
    claimer: Option<Arc<dyn RewardClaimer>>,
    sessions: ChainSessionManager,
    /// Lower-cased accounts whose claim transaction is known to be mined.
    claims_confirmed: Arc<RwLock<HashSet<String>>>,
}

impl RewardReader {
    pub fn new(claimer: Option<Arc<dyn RewardClaimer>>, sessions: ChainSessionManager) -> Self {
        Self { claimer, sessions, claims_confirmed: Arc::default() }
    }

    /// Pins `claimed = true` for `account` once its claim transaction is known to be mined.
    pub fn mark_claim_confirmed(&self, account: &str) {
        self.claims_confirmed.write().insert(account.to_ascii_lowercase());
    }

    fn claim_confirmed(&self, account: &str) -> bool {
        self.claims_confirmed.read().contains(&account.to_ascii_lowercase())
    }

    pub async fn has_claimed(&self, account: Option<&str>) -> Loadable<bool> {
        let (Some(account), Some(claimer)) = (account, self.claimer.as_ref()) else {
            return Loadable::ready(true);
        };
        if self.claim_confirmed(account) {
            return Loadable::ready(true);
        }
        match claimer.claimed(account).await {
            Ok(claimed) => Loadable::ready(claimed),
            Err(e) => {
                warn!(account, "Claim status query failed: {}", e);
                Loadable::ready(true)
            }
        }
    }

    pub async fn unclaimed_balance(&self, account: Option<&str>) -> Loadable<String> {
        let zero = || Loadable::ready("0".to_string());
        let (Some(account), Some(claimer)) = (account, self.claimer.as_ref()) else {
            return zero();
        };
        if self.claim_confirmed(account) {
            return zero();
        }
        match claimer.unclaimed_balance(account).await {
            Ok(raw) => Loadable::ready(raw),
            Err(e) => {
                warn!(account, "Unclaimed balance query failed: {}", e);
                zero()
            }
        }
    }

    /// Re-reads the claim status on every new rollup block. The task ends when
    /// `cancel` fires, every receiver is dropped, or the claim is confirmed.
    pub fn watch_claim(&self, account: &str, cancel: CancellationToken) -> watch::Receiver<Loadable<bool>> {
        let (tx, rx) = watch::channel(Loadable::loading(true));
        if self.claimer.is_none() {
            tx.send_replace(Loadable::ready(true));
            return rx;
        }

        let reader = self.clone();
        let account = account.to_ascii_lowercase();
        tokio::spawn(async move {
            let mut sessions = reader.sessions.subscribe();
            // Kept across rounds so a block mined during a query is not missed.
            let mut blocks = rollup_blocks(&mut sessions);
            loop {
                tx.send_replace(reader.has_claimed(Some(&account)).await);
                if reader.claim_confirmed(&account) {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        blocks = rollup_blocks(&mut sessions);
                    }
                    _ = next_rollup_block(&mut blocks) => {}
                }
            }
            debug!(account = %account, "Claim watcher stopped");
        });
        rx
    }
}

fn rollup_blocks(sessions: &mut watch::Receiver<Option<Arc<BridgeSession>>>) -> Option<watch::Receiver<u64>> {
    sessions.borrow_and_update().as_ref().map(|s| s.rollup.provider.subscribe_blocks())
}

/// Never resolves without a session or once the block feed closes.
async fn next_rollup_block(blocks: &mut Option<watch::Receiver<u64>>) {
    if let Some(rx) = blocks.as_mut() {
        if rx.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending().await
}
