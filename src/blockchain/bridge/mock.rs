//! In-process stand-ins for chain providers, the outbox/inbox reader and the
//! reward contract. Used by tests and by dry runs of the watcher.

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256, U64};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};

use super::{normalize_hash, MessageRef, OutgoingMessageState};
use crate::blockchain::traits::{
    ChainProvider, DepositMessage, MessageStateSource, ProviderFactory, RetryableStatus,
    RewardClaimer,
};
use crate::core::errors::BridgeError;

/// Receipt for `tx_hash` mined in `block` with the given outcome.
pub fn mock_receipt(tx_hash: &str, ok: bool, block: u64) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: H256::from_str(tx_hash).unwrap_or_default(),
        status: Some(if ok { U64::one() } else { U64::zero() }),
        block_number: Some(U64::from(block)),
        ..Default::default()
    }
}

fn receipt_hash(receipt: &TransactionReceipt) -> String {
    format!("{:?}", receipt.transaction_hash)
}

pub struct MockChainProvider {
    chain_id: u64,
    receipts: Mutex<HashMap<String, TransactionReceipt>>,
    blocks: watch::Sender<u64>,
    failing: AtomicBool,
    receipt_delay: Mutex<Option<Duration>>,
    receipt_calls: AtomicUsize,
}

impl MockChainProvider {
    pub fn new(chain_id: u64) -> Self {
        let (blocks, _) = watch::channel(0);
        Self {
            chain_id,
            receipts: Mutex::new(HashMap::new()),
            blocks,
            failing: AtomicBool::new(false),
            receipt_delay: Mutex::new(None),
            receipt_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_receipt(&self, receipt: TransactionReceipt) {
        self.receipts.lock().insert(receipt_hash(&receipt), receipt);
    }

    /// Every call errors with `ProviderUnavailable` while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Receipt queries sleep this long before answering.
    pub fn set_receipt_delay(&self, delay: Option<Duration>) {
        *self.receipt_delay.lock() = delay;
    }

    pub fn mine_block(&self, number: u64) {
        self.blocks.send_replace(number);
    }

    pub fn receipt_calls(&self) -> usize {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BridgeError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(BridgeError::ProviderUnavailable(format!("mock chain {} offline", self.chain_id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainProvider for MockChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, BridgeError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let delay = *self.receipt_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.receipts.lock().get(&normalize_hash(tx_hash)).cloned())
    }

    async fn get_block_number(&self) -> Result<u64, BridgeError> {
        self.check()?;
        Ok(*self.blocks.borrow())
    }

    fn subscribe_blocks(&self) -> watch::Receiver<u64> {
        self.blocks.subscribe()
    }
}

/// Hands out one shared [`MockChainProvider`] per chain id.
#[derive(Default)]
pub struct MockProviderFactory {
    providers: Mutex<HashMap<u64, Arc<MockChainProvider>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    failing: AtomicBool,
    connects: AtomicUsize,
}

impl MockProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self, chain_id: u64) -> Arc<MockChainProvider> {
        self.providers
            .lock()
            .entry(chain_id)
            .or_insert_with(|| Arc::new(MockChainProvider::new(chain_id)))
            .clone()
    }

    /// Makes subsequent `connect` calls wait until [`release`](Self::release).
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, connects: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.add_permits(connects);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFactory for MockProviderFactory {
    async fn connect(
        &self,
        chain_id: u64,
        rpc_url: &str,
    ) -> Result<Arc<dyn ChainProvider>, BridgeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::ProviderUnavailable(format!("cannot reach {}", rpc_url)));
        }
        let provider: Arc<dyn ChainProvider> = self.provider(chain_id);
        Ok(provider)
    }
}

fn message_key(message: &MessageRef) -> Option<String> {
    match (message.seq_num, &message.batch_number, &message.batch_index) {
        (_, Some(n), Some(i)) => Some(format!("batch:{}:{}", n, i)),
        (Some(seq), _, _) => Some(format!("seq:{}", seq)),
        _ => None,
    }
}

/// Scriptable outbox / inbox bookkeeping.
#[derive(Default)]
pub struct MockMessageSource {
    outgoing: Mutex<HashMap<String, OutgoingMessageState>>,
    withdrawals: Mutex<HashMap<String, MessageRef>>,
    deposits: Mutex<HashMap<String, DepositMessage>>,
    retryables: Mutex<HashMap<u64, RetryableStatus>>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl MockMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outgoing_state(&self, message: &MessageRef, state: OutgoingMessageState) {
        if let Some(key) = message_key(message) {
            self.outgoing.lock().insert(key, state);
        }
    }

    /// Coordinates the withdrawal `tx_hash` emits once mined.
    pub fn set_withdrawal_message(&self, tx_hash: &str, message: MessageRef) {
        self.withdrawals.lock().insert(normalize_hash(tx_hash), message);
    }

    pub fn set_deposit_message(&self, tx_hash: &str, message: DepositMessage) {
        self.deposits.lock().insert(normalize_hash(tx_hash), message);
    }

    pub fn set_retryable_status(&self, seq_num: u64, status: RetryableStatus) {
        self.retryables.lock().insert(seq_num, status);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BridgeError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(BridgeError::ProviderUnavailable("mock outbox reader offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStateSource for MockMessageSource {
    async fn outgoing_message_state(
        &self,
        _base: &dyn ChainProvider,
        message: &MessageRef,
    ) -> Result<OutgoingMessageState, BridgeError> {
        self.check()?;
        Ok(message_key(message)
            .and_then(|k| self.outgoing.lock().get(&k).copied())
            .unwrap_or(OutgoingMessageState::Unconfirmed))
    }

    async fn withdrawal_message(
        &self,
        _rollup: &dyn ChainProvider,
        receipt: &TransactionReceipt,
    ) -> Result<Option<MessageRef>, BridgeError> {
        self.check()?;
        Ok(self.withdrawals.lock().get(&receipt_hash(receipt)).cloned())
    }

    async fn deposit_message(
        &self,
        _base: &dyn ChainProvider,
        receipt: &TransactionReceipt,
    ) -> Result<Option<DepositMessage>, BridgeError> {
        self.check()?;
        Ok(self.deposits.lock().get(&receipt_hash(receipt)).cloned())
    }

    async fn retryable_status(
        &self,
        _rollup: &dyn ChainProvider,
        seq_num: u64,
    ) -> Result<RetryableStatus, BridgeError> {
        self.check()?;
        Ok(self
            .retryables
            .lock()
            .get(&seq_num)
            .copied()
            .unwrap_or(RetryableStatus::NotYetCreated))
    }
}

/// Reward contract with per-account answers. Unknown accounts have not claimed
/// and have nothing to claim.
#[derive(Default)]
pub struct MockRewardClaimer {
    claimed: Mutex<HashMap<String, bool>>,
    balances: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockRewardClaimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_claimed(&self, account: &str, claimed: bool) {
        self.claimed.lock().insert(account.to_ascii_lowercase(), claimed);
    }

    pub fn set_balance(&self, account: &str, raw: &str) {
        self.balances.lock().insert(account.to_ascii_lowercase(), raw.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every contract read sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    async fn check(&self) -> Result<(), BridgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(BridgeError::ProviderUnavailable("mock reward contract offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RewardClaimer for MockRewardClaimer {
    // Answers reflect the state when the read was issued, not when it returns.
    async fn claimed(&self, account: &str) -> Result<bool, BridgeError> {
        let claimed = self.claimed.lock().get(&account.to_ascii_lowercase()).copied().unwrap_or(false);
        self.check().await?;
        Ok(claimed)
    }

    async fn unclaimed_balance(&self, account: &str) -> Result<String, BridgeError> {
        let raw = self
            .balances
            .lock()
            .get(&account.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| "0".to_string());
        self.check().await?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::hash;
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_serves_receipts_by_hash() {
        let p = MockChainProvider::new(1);
        assert!(p.get_transaction_receipt(&hash(1)).await.unwrap().is_none());
        p.set_receipt(mock_receipt(&hash(1), true, 7));
        let r = p.get_transaction_receipt(&hash(1).to_uppercase().replacen("0X", "0x", 1)).await;
        assert_eq!(r.unwrap().unwrap().block_number, Some(U64::from(7)));
        assert_eq!(p.receipt_calls(), 2);

        p.set_failing(true);
        assert!(p.get_block_number().await.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_factory_shares_instances() {
        let f = MockProviderFactory::new();
        let a = f.connect(42161, "http://l2").await.unwrap();
        f.provider(42161).mine_block(9);
        assert_eq!(a.get_block_number().await.unwrap(), 9);
        assert_eq!(f.connects(), 1);
    }

    #[tokio::test]
    async fn test_message_source_defaults() {
        let src = MockMessageSource::new();
        let p = MockChainProvider::new(1);
        let msg = MessageRef { seq_num: Some(42), ..Default::default() };
        assert_eq!(
            src.outgoing_message_state(&p, &msg).await.unwrap(),
            OutgoingMessageState::Unconfirmed
        );
        src.set_outgoing_state(&msg, OutgoingMessageState::Confirmed);
        assert_eq!(
            src.outgoing_message_state(&p, &msg).await.unwrap(),
            OutgoingMessageState::Confirmed
        );
        assert_eq!(src.retryable_status(&p, 1).await.unwrap(), RetryableStatus::NotYetCreated);
    }
}
