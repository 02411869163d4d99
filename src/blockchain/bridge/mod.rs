// src/blockchain/bridge/mod.rs

// Expose sub-modules
pub mod commands;
pub mod mock;
pub mod poller;
pub mod read;
pub mod resolver;
pub mod session;
pub mod store;

use ethers::types::{TransactionReceipt, U64};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use commands::{CommandApi, DismissedSet, TxDraft};
pub use poller::{PassReport, StatusPoller};
pub use read::{Loadable, ReadApi, RewardReader, TransferSummary};
pub use resolver::{MessageStateResolver, OutboxExecution, UnsupportedMessageSource};
pub use session::{BridgeSession, ChainIdPair, ChainSessionManager, ChainSigner, SessionInputs, SignerOrigin};
pub use store::{StoreEvent, StoreSubscriber, SubscriptionId, TransactionStore, TxFilter, UpsertOutcome};

/// Current time in Unix milliseconds, the unit used for all record timestamps.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Which leg of a multi-leg bridge flow a record represents.
///
/// Unknown strings are kept verbatim in `Other` so records written by newer
/// versions survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BridgeTxnType {
    Deposit,
    DepositL1,
    DepositL2,
    Withdraw,
    Outbox,
    Approve,
    ExternalDeposit,
    ExternalWithdraw,
    DepositL2AutoRedeem,
    Other(String),
}

impl BridgeTxnType {
    pub fn as_str(&self) -> &str {
        match self {
            BridgeTxnType::Deposit => "deposit",
            BridgeTxnType::DepositL1 => "deposit-l1",
            BridgeTxnType::DepositL2 => "deposit-l2",
            BridgeTxnType::Withdraw => "withdraw",
            BridgeTxnType::Outbox => "outbox",
            BridgeTxnType::Approve => "approve",
            BridgeTxnType::ExternalDeposit => "external-deposit",
            BridgeTxnType::ExternalWithdraw => "external-withdraw",
            BridgeTxnType::DepositL2AutoRedeem => "deposit-l2-auto-redeem",
            BridgeTxnType::Other(s) => s.as_str(),
        }
    }

    /// Legs whose completion depends on an outgoing L2 -> L1 message.
    pub fn is_withdrawal(&self) -> bool {
        matches!(self, BridgeTxnType::Withdraw)
    }
}

impl From<String> for BridgeTxnType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "deposit" => BridgeTxnType::Deposit,
            "deposit-l1" => BridgeTxnType::DepositL1,
            "deposit-l2" => BridgeTxnType::DepositL2,
            "withdraw" => BridgeTxnType::Withdraw,
            "outbox" => BridgeTxnType::Outbox,
            "approve" => BridgeTxnType::Approve,
            "external-deposit" => BridgeTxnType::ExternalDeposit,
            "external-withdraw" => BridgeTxnType::ExternalWithdraw,
            "deposit-l2-auto-redeem" => BridgeTxnType::DepositL2AutoRedeem,
            _ => BridgeTxnType::Other(s),
        }
    }
}

impl From<BridgeTxnType> for String {
    fn from(t: BridgeTxnType) -> Self {
        match t {
            BridgeTxnType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for BridgeTxnType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BridgeTxnType::from(s.to_string()))
    }
}

impl fmt::Display for BridgeTxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of asset moved by a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeAssetType {
    #[serde(rename = "NATIVE", alias = "ETH")]
    Native,
    #[serde(rename = "TOKEN", alias = "ERC20")]
    Token,
    #[serde(rename = "NFT", alias = "ERC721")]
    Nft,
}

impl BridgeAssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeAssetType::Native => "NATIVE",
            BridgeAssetType::Token => "TOKEN",
            BridgeAssetType::Nft => "NFT",
        }
    }
}

impl FromStr for BridgeAssetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NATIVE" | "ETH" => Ok(BridgeAssetType::Native),
            "TOKEN" | "ERC20" => Ok(BridgeAssetType::Token),
            "NFT" | "ERC721" => Ok(BridgeAssetType::Nft),
            other => Err(format!("unknown asset type: {}", other)),
        }
    }
}

/// State of an L2 -> L1 message. Ordered; a record's state only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutgoingMessageState {
    Unconfirmed,
    Confirmed,
    Executed,
}

impl OutgoingMessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutgoingMessageState::Unconfirmed => "unconfirmed",
            OutgoingMessageState::Confirmed => "confirmed",
            OutgoingMessageState::Executed => "executed",
        }
    }
}

impl FromStr for OutgoingMessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unconfirmed" => Ok(OutgoingMessageState::Unconfirmed),
            "confirmed" => Ok(OutgoingMessageState::Confirmed),
            "executed" => Ok(OutgoingMessageState::Executed),
            other => Err(format!("unknown outgoing message state: {}", other)),
        }
    }
}

/// Retryable-ticket outcome of a `deposit-l2` leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedeemState {
    /// Ticket not yet observed as redeemed or failed.
    Pending,
    /// Auto-redeem did not run or failed; a redeem transaction is needed.
    Required,
    Redeemed,
    Expired,
}

impl RedeemState {
    pub(crate) fn rank(self) -> u8 {
        match self {
            RedeemState::Pending => 0,
            RedeemState::Required => 1,
            RedeemState::Redeemed | RedeemState::Expired => 2,
        }
    }

    pub fn is_final(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedeemState::Pending => "pending",
            RedeemState::Required => "required",
            RedeemState::Redeemed => "redeemed",
            RedeemState::Expired => "expired",
        }
    }
}

impl FromStr for RedeemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RedeemState::Pending),
            "required" => Ok(RedeemState::Required),
            "redeemed" => Ok(RedeemState::Redeemed),
            "expired" => Ok(RedeemState::Expired),
            other => Err(format!("unknown redeem state: {}", other)),
        }
    }
}

/// Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeTxnStatus {
    Pending,
    Confirmed,
    Failure,
    DisputePeriod,
}

/// Finer-grained view of a withdrawal leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalPhase {
    Unconfirmed,
    DisputePeriod,
    Executable,
    Executed,
}

/// Primary key of a record: the chain the leg was submitted on plus its hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKey {
    pub chain_id: u64,
    pub tx_hash: String,
}

impl TxKey {
    pub fn new(chain_id: u64, tx_hash: &str) -> Self {
        Self { chain_id, tx_hash: normalize_hash(tx_hash) }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain_id, self.tx_hash)
    }
}

pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}

/// Cross-chain message coordinates of a leg.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageRef {
    pub seq_num: Option<u64>,
    pub batch_number: Option<String>,
    pub batch_index: Option<String>,
}

impl MessageRef {
    pub fn is_empty(&self) -> bool {
        self.seq_num.is_none() && self.batch_number.is_none() && self.batch_index.is_none()
    }
}

/// One cross-chain operation leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTxn {
    #[serde(rename = "type")]
    pub tx_type: BridgeTxnType,
    pub chain_id: u64,
    pub sender: String,
    pub asset_name: String,
    pub asset_type: BridgeAssetType,
    pub value: String,
    pub tx_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_resolved: Option<i64>,
    pub timestamp_created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing_message_state: Option<OutgoingMessageState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_state: Option<RedeemState>,
    /// No receipt arrived within the wait horizon.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dropped: bool,
}

fn set_once<T: Clone>(dst: &mut Option<T>, src: &Option<T>) -> bool {
    if dst.is_none() && src.is_some() {
        *dst = src.clone();
        true
    } else {
        false
    }
}

impl BridgeTxn {
    /// A fresh pending leg with a native zero-value asset; use the `with_*` helpers to fill in.
    pub fn new(tx_type: BridgeTxnType, chain_id: u64, tx_hash: &str, sender: &str) -> Self {
        Self {
            tx_type,
            chain_id,
            sender: sender.to_ascii_lowercase(),
            asset_name: "ETH".to_string(),
            asset_type: BridgeAssetType::Native,
            value: "0".to_string(),
            tx_hash: normalize_hash(tx_hash),
            block_number: None,
            timestamp_resolved: None,
            timestamp_created: now_millis(),
            receipt: None,
            seq_num: None,
            batch_number: None,
            batch_index: None,
            partner_tx_hash: None,
            outgoing_message_state: None,
            redeem_state: None,
            dropped: false,
        }
    }

    pub fn with_asset(mut self, name: &str, asset_type: BridgeAssetType, value: &str) -> Self {
        self.asset_name = name.to_string();
        self.asset_type = asset_type;
        self.value = value.to_string();
        self
    }

    pub fn with_seq_num(mut self, seq_num: u64) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    pub fn with_partner(mut self, partner_tx_hash: &str) -> Self {
        self.partner_tx_hash = Some(normalize_hash(partner_tx_hash));
        self
    }

    pub fn created_at(mut self, millis: i64) -> Self {
        self.timestamp_created = millis;
        self
    }

    pub fn key(&self) -> TxKey {
        TxKey::new(self.chain_id, &self.tx_hash)
    }

    /// Lower-cases hashes and the sender so keys compare consistently.
    pub fn normalized(mut self) -> Self {
        self.tx_hash = normalize_hash(&self.tx_hash);
        self.sender = self.sender.to_ascii_lowercase();
        self.partner_tx_hash = self.partner_tx_hash.map(|h| normalize_hash(&h));
        self
    }

    /// `None` while no receipt is attached. A missing status field (pre-Byzantium) counts as success.
    pub fn receipt_succeeded(&self) -> Option<bool> {
        self.receipt.as_ref().map(|r| r.status != Some(U64::zero()))
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            seq_num: self.seq_num,
            batch_number: self.batch_number.clone(),
            batch_index: self.batch_index.clone(),
        }
    }

    /// Failure dominates: a failed receipt or a dropped transaction is `failure`
    /// whatever message state arrives later.
    pub fn status(&self) -> BridgeTxnStatus {
        if self.dropped {
            return BridgeTxnStatus::Failure;
        }
        match self.receipt_succeeded() {
            None => BridgeTxnStatus::Pending,
            Some(false) => BridgeTxnStatus::Failure,
            Some(true) if self.tx_type.is_withdrawal() => match self.outgoing_message_state {
                Some(OutgoingMessageState::Confirmed) | Some(OutgoingMessageState::Executed) => {
                    BridgeTxnStatus::Confirmed
                }
                _ => BridgeTxnStatus::DisputePeriod,
            },
            Some(true) => BridgeTxnStatus::Confirmed,
        }
    }

    /// `None` for non-withdrawal legs and for failed withdrawals.
    pub fn withdrawal_phase(&self) -> Option<WithdrawalPhase> {
        if !self.tx_type.is_withdrawal() || self.status() == BridgeTxnStatus::Failure {
            return None;
        }
        if self.receipt.is_none() {
            return Some(WithdrawalPhase::Unconfirmed);
        }
        Some(match self.outgoing_message_state {
            None | Some(OutgoingMessageState::Unconfirmed) => WithdrawalPhase::DisputePeriod,
            Some(OutgoingMessageState::Confirmed) => WithdrawalPhase::Executable,
            Some(OutgoingMessageState::Executed) => WithdrawalPhase::Executed,
        })
    }

    /// Whether any further lifecycle change is expected for this leg alone.
    pub fn is_settled(&self) -> bool {
        if self.dropped {
            return true;
        }
        let Some(ok) = self.receipt_succeeded() else {
            return false;
        };
        match self.tx_type {
            BridgeTxnType::DepositL2 => self.redeem_state.map(RedeemState::is_final).unwrap_or(false),
            _ if !ok => true,
            BridgeTxnType::Withdraw => {
                self.outgoing_message_state == Some(OutgoingMessageState::Executed)
            }
            BridgeTxnType::DepositL1 => self.partner_tx_hash.is_some(),
            _ => true,
        }
    }

    /// Folds `patch` into `self`. Identity fields and `timestampCreated` never change;
    /// write-once fields are only filled when empty; message and redeem state only
    /// move forward; `dropped` holds only while no receipt has been seen. Returns
    /// whether anything changed, so applying the same patch twice reports a change
    /// at most once.
    pub fn merge(&mut self, patch: &BridgeTxn) -> bool {
        let mut changed = false;
        if set_once(&mut self.receipt, &patch.receipt) {
            // A late receipt means the transaction was mined after all.
            self.dropped = false;
            changed = true;
        }
        changed |= set_once(&mut self.block_number, &patch.block_number);
        changed |= set_once(&mut self.timestamp_resolved, &patch.timestamp_resolved);
        changed |= set_once(&mut self.seq_num, &patch.seq_num);
        changed |= set_once(&mut self.batch_number, &patch.batch_number);
        changed |= set_once(&mut self.batch_index, &patch.batch_index);
        changed |= set_once(&mut self.partner_tx_hash, &patch.partner_tx_hash);

        if let Some(next) = patch.outgoing_message_state {
            if self.outgoing_message_state.map_or(true, |cur| next > cur) {
                self.outgoing_message_state = Some(next);
                changed = true;
            }
        }
        if let Some(next) = patch.redeem_state {
            if self.redeem_state.map_or(true, |cur| next.rank() > cur.rank()) {
                self.redeem_state = Some(next);
                changed = true;
            }
        }
        if patch.dropped && !self.dropped && self.receipt.is_none() {
            self.dropped = true;
            changed = true;
        }
        changed
    }
}
