//! Tip Dispatcher
//!
//! Submits a single native-asset transfer and waits for it to be mined.
//! A dispatch is attempted exactly once: any failure, including an unknown
//! confirmation status, is final for that mention. Retrying a transfer whose
//! broadcast state is unknown could pay the same person twice.

use alloy::primitives::utils::format_ether;
use alloy::primitives::{Address, TxHash, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

use crate::chain::{ChainWriter, DEFAULT_CONFIRMATION_TIMEOUT_SECS};

/// Extra slack on top of the node-side confirmation timeout
const CONFIRMATION_GRACE: Duration = Duration::from_secs(10);

/// Stage at which a dispatch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    /// The transfer was never accepted by the node
    Submission,
    /// The transfer was broadcast but not confirmed as successful
    Confirmation,
}

/// Terminal state of a dispatched tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TipStatus {
    Confirmed {
        tx_hash: TxHash,
        block_number: Option<u64>,
    },
    Failed {
        stage: DispatchStage,
        /// Hash of the broadcast transfer, if it got that far
        submitted: Option<TxHash>,
        reason: String,
    },
}

/// Result of one dispatch. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipOutcome {
    pub to: Address,
    pub amount: U256,
    pub status: TipStatus,
}

impl TipOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, TipStatus::Confirmed { .. })
    }

    /// Hash of the confirmed transfer
    pub fn confirmation_hash(&self) -> Option<TxHash> {
        match self.status {
            TipStatus::Confirmed { tx_hash, .. } => Some(tx_hash),
            TipStatus::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            TipStatus::Confirmed { .. } => None,
            TipStatus::Failed { reason, .. } => Some(reason),
        }
    }

    fn failed(to: Address, amount: U256, stage: DispatchStage, submitted: Option<TxHash>, reason: String) -> Self {
        Self {
            to,
            amount,
            status: TipStatus::Failed {
                stage,
                submitted,
                reason,
            },
        }
    }
}

/// Sends tips from the configured wallet
#[derive(Clone)]
pub struct TipDispatcher {
    writer: Arc<dyn ChainWriter>,
    confirmation_timeout: Duration,
}

impl TipDispatcher {
    pub fn new(writer: Arc<dyn ChainWriter>) -> Self {
        Self {
            writer,
            confirmation_timeout: Duration::from_secs(DEFAULT_CONFIRMATION_TIMEOUT_SECS),
        }
    }

    pub fn with_confirmation_timeout(mut self, confirmation_timeout: Duration) -> Self {
        self.confirmation_timeout = confirmation_timeout;
        self
    }

    /// Submit one transfer of `amount` to `to` and wait for confirmation
    ///
    /// # Returns
    /// A `TipOutcome` carrying either the confirmation hash or the reason
    /// the transfer failed. Submission is attempted at most once.
    pub async fn dispatch(&self, to: Address, amount: U256) -> TipOutcome {
        let pending = match self.writer.send_transfer(to, amount).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(to = %to, error = %e, "Tip submission failed");
                return TipOutcome::failed(to, amount, DispatchStage::Submission, None, e.to_string());
            }
        };

        info!(
            to = %to,
            amount = %format_ether(amount),
            tx_hash = %pending.tx_hash,
            "Tip submitted, awaiting confirmation"
        );

        let wait = self.confirmation_timeout + CONFIRMATION_GRACE;
        let confirmed = match timeout(wait, self.writer.await_confirmation(pending)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no confirmation within {:?}", wait)),
        };

        match confirmed {
            Ok(receipt) => {
                info!(to = %to, tx_hash = %receipt.tx_hash, "Tip confirmed");
                TipOutcome {
                    to,
                    amount,
                    status: TipStatus::Confirmed {
                        tx_hash: receipt.tx_hash,
                        block_number: receipt.block_number,
                    },
                }
            }
            Err(reason) => {
                error!(to = %to, tx_hash = %pending.tx_hash, error = %reason, "Tip confirmation failed");
                TipOutcome::failed(
                    to,
                    amount,
                    DispatchStage::Confirmation,
                    Some(pending.tx_hash),
                    reason,
                )
            }
        }
    }
}
