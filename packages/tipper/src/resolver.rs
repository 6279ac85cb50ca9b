//! Transaction Resolver
//!
//! Turns mention text into the wallet that originated the referenced
//! transaction. Extraction is purely lexical; resolution is a single
//! read-only lookup against the chain node.

use alloy::primitives::Address;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::chain::{ChainError, ChainReader};
use crate::extract::{extract_reference_with_source, TxReference};

/// Default upper bound on a single transaction lookup
pub const DEFAULT_LOOKUP_TIMEOUT_SECS: u64 = 15;

/// Errors that can occur during resolution.
///
/// A missing transaction is not an error; only a failed lookup is.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Transaction lookup failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Transaction lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// A transaction the node confirmed exists, with its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTransaction {
    pub reference: TxReference,
    pub originator: Address,
}

/// Extracts references from text and resolves them against the chain
#[derive(Clone)]
pub struct TransactionResolver {
    reader: Arc<dyn ChainReader>,
    lookup_timeout: Duration,
}

impl TransactionResolver {
    pub fn new(reader: Arc<dyn ChainReader>) -> Self {
        Self {
            reader,
            lookup_timeout: Duration::from_secs(DEFAULT_LOOKUP_TIMEOUT_SECS),
        }
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    /// Extract a transaction reference from mention text
    ///
    /// # Returns
    /// `None` when the text carries no reference; this is the common case
    pub fn extract_reference(&self, text: &str) -> Option<TxReference> {
        let (reference, source) = extract_reference_with_source(text)?;
        debug!(tx_hash = %reference, source = source.name(), "Extracted transaction reference");
        Some(reference)
    }

    /// Resolve a reference to the address that sent the transaction
    ///
    /// # Returns
    /// * `Ok(Some(_))` if the node knows the transaction
    /// * `Ok(None)` if the node reports it does not exist
    /// * `Err(_)` if the lookup itself failed or timed out
    pub async fn resolve(
        &self,
        reference: TxReference,
    ) -> Result<Option<ResolvedTransaction>, ResolveError> {
        let sender = timeout(self.lookup_timeout, self.reader.transaction_sender(reference.hash()))
            .await
            .map_err(|_| ResolveError::Timeout(self.lookup_timeout))??;

        match sender {
            Some(originator) => Ok(Some(ResolvedTransaction {
                reference,
                originator,
            })),
            None => {
                info!(tx_hash = %reference, "Transaction not found");
                Ok(None)
            }
        }
    }
}
