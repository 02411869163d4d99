use async_trait::async_trait;
use ethers::types::TransactionReceipt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{BridgeTxn, BridgeTxnStatus, BridgeTxnType, MessageRef, OutgoingMessageState, RedeemState, TxKey};
use crate::blockchain::traits::{ChainProvider, DepositMessage, MessageStateSource, RetryableStatus};
use crate::core::errors::BridgeError;

/// Everything an external signer needs to execute a confirmed withdrawal on the base chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxExecution {
    pub withdrawal: TxKey,
    /// Base chain the outbox call must be sent to.
    pub target_chain_id: Option<u64>,
    pub sender: String,
    pub asset_name: String,
    pub value: String,
    pub message: MessageRef,
}

/// Answers "where is this cross-chain message" questions on top of a
/// [`MessageStateSource`], enforcing the monotonic message-state order.
#[derive(Clone)]
pub struct MessageStateResolver {
    source: Arc<dyn MessageStateSource>,
}

fn query_failed(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::MessageStateQueryFailed(_) => e,
        other => BridgeError::MessageStateQueryFailed(other.to_string()),
    }
}

impl MessageStateResolver {
    pub fn new(source: Arc<dyn MessageStateSource>) -> Self {
        Self { source }
    }

    /// Current outgoing state of a withdrawal, never lower than what the record
    /// already holds. `None` while the record has no message coordinates.
    pub async fn outgoing_state(
        &self,
        base: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<Option<OutgoingMessageState>, BridgeError> {
        let message = tx.message_ref();
        if message.is_empty() {
            return Ok(None);
        }
        let reported =
            self.source.outgoing_message_state(base, &message).await.map_err(query_failed)?;
        let state = match tx.outgoing_message_state {
            Some(current) if current > reported => {
                debug!(key = %tx.key(), ?current, ?reported, "Ignoring regressed message state");
                current
            }
            _ => reported,
        };
        Ok(Some(state))
    }

    /// Coordinates emitted by a mined withdrawal.
    pub async fn withdrawal_coordinates(
        &self,
        rollup: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<Option<MessageRef>, BridgeError> {
        let Some(receipt) = tx.receipt.as_ref() else {
            return Ok(None);
        };
        let message = self.source.withdrawal_message(rollup, receipt).await.map_err(query_failed)?;
        Ok(message.filter(|m| !m.is_empty()))
    }

    /// L1 -> L2 message created by a mined `deposit-l1`.
    pub async fn deposit_message(
        &self,
        base: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<Option<DepositMessage>, BridgeError> {
        let Some(receipt) = tx.receipt.as_ref() else {
            return Ok(None);
        };
        self.source.deposit_message(base, receipt).await.map_err(query_failed)
    }

    /// Retryable-ticket state of a `deposit-l2`. A failed creation receipt is a
    /// floor of `required`: the ticket is still queried so a later redeem or
    /// expiry is seen, and a failed query falls back to the floor.
    pub async fn redeem_state(
        &self,
        rollup: &dyn ChainProvider,
        tx: &BridgeTxn,
    ) -> Result<Option<RedeemState>, BridgeError> {
        let floor = (tx.receipt_succeeded() == Some(false)).then_some(RedeemState::Required);
        let Some(seq_num) = tx.seq_num else {
            return Ok(floor);
        };
        let reported = match self.source.retryable_status(rollup, seq_num).await {
            Ok(status) => status.redeem_state(),
            Err(e) if floor.is_some() => {
                debug!(key = %tx.key(), "Retryable query failed, keeping required: {}", e);
                return Ok(floor);
            }
            Err(e) => return Err(query_failed(e)),
        };
        Ok(Some(match floor {
            Some(floor) if floor.rank() > reported.rank() => floor,
            _ => reported,
        }))
    }

    /// Whether a `deposit-l2` leg may be followed by an auto-redeem leg.
    pub fn needs_redeem(tx: &BridgeTxn) -> bool {
        if tx.tx_type != BridgeTxnType::DepositL2 || tx.redeem_state.map_or(false, RedeemState::is_final) {
            return false;
        }
        tx.receipt_succeeded() == Some(false) || tx.redeem_state == Some(RedeemState::Required)
    }

    /// Fails fast unless the withdrawal's message is `confirmed`: execution
    /// before confirmation would be rejected on chain, and after execution it
    /// would double spend.
    pub fn ensure_executable(tx: &BridgeTxn) -> Result<OutboxExecution, BridgeError> {
        if !tx.tx_type.is_withdrawal() {
            return Err(BridgeError::InvalidSubmission(format!(
                "{} is a {} leg, not a withdrawal",
                tx.key(),
                tx.tx_type
            )));
        }
        let ineligible = |state: &str| BridgeError::OutboxExecutionIneligible {
            tx_hash: tx.tx_hash.clone(),
            state: state.to_string(),
        };
        if tx.status() == BridgeTxnStatus::Failure {
            return Err(ineligible("failure"));
        }
        match tx.outgoing_message_state {
            Some(OutgoingMessageState::Confirmed) => {}
            Some(other) => return Err(ineligible(other.as_str())),
            None => return Err(ineligible("unknown")),
        }
        let message = tx.message_ref();
        if message.is_empty() {
            return Err(ineligible("no message coordinates"));
        }
        Ok(OutboxExecution {
            withdrawal: tx.key(),
            target_chain_id: None,
            sender: tx.sender.clone(),
            asset_name: tx.asset_name.clone(),
            value: tx.value.clone(),
            message,
        })
    }
}

/// Source used when no outbox/inbox reader is wired in. Receipts still confirm,
/// message coordinates are never found and state queries fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedMessageSource;

#[async_trait]
impl MessageStateSource for UnsupportedMessageSource {
    async fn outgoing_message_state(
        &self,
        _base: &dyn ChainProvider,
        _message: &MessageRef,
    ) -> Result<OutgoingMessageState, BridgeError> {
        Err(BridgeError::MessageStateQueryFailed("no outbox reader configured".into()))
    }

    async fn withdrawal_message(
        &self,
        _rollup: &dyn ChainProvider,
        _receipt: &TransactionReceipt,
    ) -> Result<Option<MessageRef>, BridgeError> {
        Ok(None)
    }

    async fn deposit_message(
        &self,
        _base: &dyn ChainProvider,
        _receipt: &TransactionReceipt,
    ) -> Result<Option<DepositMessage>, BridgeError> {
        Ok(None)
    }

    async fn retryable_status(
        &self,
        _rollup: &dyn ChainProvider,
        _seq_num: u64,
    ) -> Result<RetryableStatus, BridgeError> {
        Err(BridgeError::MessageStateQueryFailed("no inbox reader configured".into()))
    }
}
