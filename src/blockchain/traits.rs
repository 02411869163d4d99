use async_trait::async_trait;
use ethers::types::TransactionReceipt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::blockchain::bridge::{MessageRef, OutgoingMessageState, RedeemState};
use crate::core::errors::BridgeError;

/// Read access to one chain.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Chain id this provider is connected to.
    fn chain_id(&self) -> u64;

    /// `Ok(None)` means the transaction is not mined yet; that is not an error.
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, BridgeError>;

    async fn get_block_number(&self) -> Result<u64, BridgeError>;

    /// Latest block number seen by this provider. Several blocks arriving between
    /// two reads of the receiver coalesce into one change notification.
    fn subscribe_blocks(&self) -> watch::Receiver<u64>;
}

/// Builds providers for chains the connected wallet is not on.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn connect(
        &self,
        chain_id: u64,
        rpc_url: &str,
    ) -> Result<Arc<dyn ChainProvider>, BridgeError>;
}

/// L1 -> L2 message produced by a confirmed `deposit-l1` leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositMessage {
    pub seq_num: u64,
    /// Hash of the retryable-ticket creation on the rollup (the `deposit-l2` leg).
    pub retryable_tx_hash: String,
    /// Hash the auto-redeem leg gets if it has to be tracked.
    pub auto_redeem_tx_hash: String,
}

/// Rollup-side view of a retryable ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryableStatus {
    NotYetCreated,
    CreationFailed,
    /// Funds arrived but the auto-redeem did not succeed; manual redeem needed.
    FundsDepositedOnL2,
    Redeemed,
    Expired,
}

impl RetryableStatus {
    pub fn redeem_state(self) -> RedeemState {
        match self {
            RetryableStatus::NotYetCreated => RedeemState::Pending,
            RetryableStatus::CreationFailed | RetryableStatus::FundsDepositedOnL2 => {
                RedeemState::Required
            }
            RetryableStatus::Redeemed => RedeemState::Redeemed,
            RetryableStatus::Expired => RedeemState::Expired,
        }
    }
}

/// The rollup's canonical outbox / inbox bookkeeping. Contract encoding lives
/// behind this trait; the engine only consumes its answers.
#[async_trait]
pub trait MessageStateSource: Send + Sync {
    /// State of an outgoing (L2 -> L1) message, read through the base-chain provider.
    async fn outgoing_message_state(
        &self,
        base: &dyn ChainProvider,
        message: &MessageRef,
    ) -> Result<OutgoingMessageState, BridgeError>;

    /// Message coordinates emitted by a confirmed withdrawal on the rollup.
    async fn withdrawal_message(
        &self,
        rollup: &dyn ChainProvider,
        receipt: &TransactionReceipt,
    ) -> Result<Option<MessageRef>, BridgeError>;

    /// Message created by a confirmed deposit on the base chain.
    async fn deposit_message(
        &self,
        base: &dyn ChainProvider,
        receipt: &TransactionReceipt,
    ) -> Result<Option<DepositMessage>, BridgeError>;

    async fn retryable_status(
        &self,
        rollup: &dyn ChainProvider,
        seq_num: u64,
    ) -> Result<RetryableStatus, BridgeError>;
}

/// Reward claim contract client.
#[async_trait]
pub trait RewardClaimer: Send + Sync {
    async fn claimed(&self, account: &str) -> Result<bool, BridgeError>;

    /// Raw base-unit amount still claimable by `account`.
    async fn unclaimed_balance(&self, account: &str) -> Result<String, BridgeError>;
}
