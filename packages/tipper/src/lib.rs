//! Mention Tipper Library
//!
//! This crate provides components for watching a social feed for mentions
//! that reference an on-chain transaction, resolving the transaction's
//! sender, paying them a tip and replying with the receipt.

pub mod backoff;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod dispatcher;
pub mod extract;
pub mod feed;
pub mod notifier;
pub mod resolver;

// Re-export commonly used types
pub use chain::{ChainError, ChainReader, ChainWriter, RpcChain, RpcConnection};
pub use config::TipperConfig;
pub use coordinator::{Coordinator, CoordinatorSettings, MentionOutcome};
pub use dedup::Deduplicator;
pub use dispatcher::{TipDispatcher, TipOutcome};
pub use extract::{extract_reference, TxReference};
pub use feed::{Mention, MentionSource};
pub use notifier::{NotificationOutcome, ReplyNotifier};
pub use resolver::{ResolvedTransaction, TransactionResolver};
