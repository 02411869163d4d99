use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use super::resolver::{MessageStateResolver, OutboxExecution};
use super::store::{TransactionStore, UpsertOutcome};
use super::{BridgeAssetType, BridgeTxn, BridgeTxnType, TxKey};
use crate::blockchain::network::NetworkRegistry;
use crate::core::errors::BridgeError;
use crate::core::validation::{
    validate_asset_name, validate_ethereum_address, validate_raw_amount, validate_tx_hash,
};

/// Keys hidden from default views. Kept in memory only.
pub type DismissedSet = Arc<RwLock<HashSet<TxKey>>>;

/// A transaction record as submitted by a wallet front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxDraft {
    #[serde(rename = "type")]
    pub tx_type: Option<BridgeTxnType>,
    pub chain_id: Option<u64>,
    pub tx_hash: Option<String>,
    pub sender: Option<String>,
    pub asset_name: Option<String>,
    pub asset_type: Option<BridgeAssetType>,
    pub value: Option<String>,
    pub seq_num: Option<u64>,
    pub batch_number: Option<String>,
    pub batch_index: Option<String>,
    pub partner_tx_hash: Option<String>,
}

impl TxDraft {
    pub fn new(tx_type: BridgeTxnType, chain_id: u64, tx_hash: &str, sender: &str) -> Self {
        Self {
            tx_type: Some(tx_type),
            chain_id: Some(chain_id),
            tx_hash: Some(tx_hash.to_string()),
            sender: Some(sender.to_string()),
            ..Self::default()
        }
    }

    pub fn asset(mut self, name: &str, asset_type: BridgeAssetType, value: &str) -> Self {
        self.asset_name = Some(name.to_string());
        self.asset_type = Some(asset_type);
        self.value = Some(value.to_string());
        self
    }

    pub fn partner(mut self, partner_tx_hash: &str) -> Self {
        self.partner_tx_hash = Some(partner_tx_hash.to_string());
        self
    }

    pub fn seq_num(mut self, seq_num: u64) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    fn required<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T, BridgeError> {
        field
            .as_ref()
            .ok_or_else(|| BridgeError::InvalidSubmission(format!("missing required field: {}", name)))
    }

    /// Checks the draft and turns it into a fresh pending record.
    pub fn into_record(self, registry: &NetworkRegistry) -> Result<BridgeTxn, BridgeError> {
        let tx_type = Self::required(&self.tx_type, "type")?.clone();
        let chain_id = *Self::required(&self.chain_id, "chainId")?;
        let tx_hash = Self::required(&self.tx_hash, "txHash")?;
        let sender = Self::required(&self.sender, "sender")?;

        if !registry.contains(chain_id) {
            return Err(BridgeError::InvalidSubmission(format!("unknown chain id {}", chain_id)));
        }
        validate_tx_hash(tx_hash)?;
        validate_ethereum_address(sender)?;
        if let Some(value) = &self.value {
            validate_raw_amount(value)?;
        }
        if let Some(name) = &self.asset_name {
            validate_asset_name(name)?;
        }
        if let Some(partner) = &self.partner_tx_hash {
            validate_tx_hash(partner)?;
        }

        let mut tx = BridgeTxn::new(tx_type, chain_id, tx_hash, sender);
        if let Some(name) = self.asset_name {
            tx.asset_name = name;
        }
        if let Some(asset_type) = self.asset_type {
            tx.asset_type = asset_type;
        }
        if let Some(value) = self.value {
            tx.value = value;
        }
        tx.seq_num = self.seq_num;
        tx.batch_number = self.batch_number;
        tx.batch_index = self.batch_index;
        tx.partner_tx_hash = self.partner_tx_hash;
        Ok(tx.normalized())
    }
}

/// Write surface used by wallet front ends.
#[derive(Clone)]
pub struct CommandApi {
    store: Arc<TransactionStore>,
    registry: Arc<NetworkRegistry>,
    dismissed: DismissedSet,
    refresh: Arc<Notify>,
}

impl CommandApi {
    pub fn new(
        store: Arc<TransactionStore>,
        registry: Arc<NetworkRegistry>,
        dismissed: DismissedSet,
        refresh: Arc<Notify>,
    ) -> Self {
        Self { store, registry, dismissed, refresh }
    }

    /// Validates `draft` and records it. Re-submitting a known hash is a no-op.
    pub fn submit(&self, draft: TxDraft) -> Result<UpsertOutcome, BridgeError> {
        let tx = draft.into_record(&self.registry)?;
        match tx.tx_type {
            BridgeTxnType::Outbox => self.check_outbox_draft(&tx)?,
            BridgeTxnType::DepositL2AutoRedeem => self.check_auto_redeem_draft(&tx)?,
            _ => {}
        }

        let key = tx.key();
        let tx_type = tx.tx_type.clone();
        let outcome = self.store.upsert(tx);
        if outcome == UpsertOutcome::Inserted {
            info!(key = %key, tx_type = %tx_type, "Bridge transaction submitted");
            self.refresh.notify_one();
        }
        Ok(outcome)
    }

    /// Hides a record from default views. Returns whether it was visible before.
    pub fn dismiss(&self, chain_id: u64, tx_hash: &str) -> Result<bool, BridgeError> {
        let key = TxKey::new(chain_id, tx_hash);
        if !self.store.contains(key.chain_id, &key.tx_hash) {
            return Err(BridgeError::NotFound(format!("transaction {}", key)));
        }
        Ok(self.dismissed.write().insert(key))
    }

    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// What an external signer needs to execute the withdrawal's outbox entry.
    pub fn prepare_outbox_execution(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<OutboxExecution, BridgeError> {
        let tx = self
            .store
            .get(chain_id, tx_hash)
            .ok_or_else(|| BridgeError::NotFound(format!("transaction {}", TxKey::new(chain_id, tx_hash))))?;
        let mut execution = MessageStateResolver::ensure_executable(&tx)?;
        execution.target_chain_id = self.registry.partner_of(chain_id);
        Ok(execution)
    }

    /// Explicit user-initiated history wipe for one account.
    pub fn clear_history(&self, account: &str) -> Vec<BridgeTxn> {
        let removed = self.store.remove_by_account(account);
        if !removed.is_empty() {
            let mut dismissed = self.dismissed.write();
            for tx in &removed {
                dismissed.remove(&tx.key());
            }
            info!(account, count = removed.len(), "Cleared bridge history");
        }
        removed
    }

    fn check_outbox_draft(&self, outbox: &BridgeTxn) -> Result<(), BridgeError> {
        let partner = outbox.partner_tx_hash.as_deref().ok_or_else(|| {
            BridgeError::InvalidSubmission("outbox draft needs the withdrawal as partnerTxHash".into())
        })?;
        if self.store.contains(outbox.chain_id, &outbox.tx_hash) {
            return Ok(());
        }
        let withdrawal = self
            .registry
            .partner_of(outbox.chain_id)
            .and_then(|rollup| self.store.get(rollup, partner))
            .ok_or_else(|| {
                BridgeError::InvalidSubmission(format!("outbox partner {} is not a tracked withdrawal", partner))
            })?;
        MessageStateResolver::ensure_executable(&withdrawal).map(|_| ())
    }

    fn check_auto_redeem_draft(&self, redeem: &BridgeTxn) -> Result<(), BridgeError> {
        let partner = redeem.partner_tx_hash.as_deref().ok_or_else(|| {
            BridgeError::InvalidSubmission("auto-redeem draft needs its deposit-l2 as partnerTxHash".into())
        })?;
        if self.store.contains(redeem.chain_id, &redeem.tx_hash) {
            return Ok(());
        }
        match self.store.get(redeem.chain_id, partner) {
            Some(l2) if MessageStateResolver::needs_redeem(&l2) => Ok(()),
            Some(_) => Err(BridgeError::InvalidSubmission(format!(
                "deposit {} does not need a redeem",
                partner
            ))),
            None => Err(BridgeError::InvalidSubmission(format!(
                "auto-redeem partner {} is not a tracked deposit-l2",
                partner
            ))),
        }
    }
}
