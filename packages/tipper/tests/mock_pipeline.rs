//! Mock Pipeline Integration Tests
//!
//! Runs the full coordinator against in-memory chain, reply and feed fakes
//! (no external dependencies). Verifies extract → resolve → dispatch → notify
//! and the at-most-once tipping guarantees under duplicate delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mention_tipper::chain::{ChainError, ChainReader, ChainWriter, PendingTransfer, TransferReceipt};
use mention_tipper::coordinator::{Coordinator, CoordinatorSettings, MentionOutcome};
use mention_tipper::feed::{FeedError, Mention, MentionSource};
use mention_tipper::notifier::{DeliveryMethod, ReplyChannel, ReplyNotifier};
use mention_tipper::{TipDispatcher, TransactionResolver};

const EXPLORER: &str = "https://aeneid.storyscan.xyz";

fn tx_hash(byte: u8) -> TxHash {
    TxHash::repeat_byte(byte)
}

fn mention_for(id: &str, hash: TxHash) -> Mention {
    Mention::new(id, "author", format!("@bot check {}/tx/{:#x}", EXPLORER, hash))
}

/// Mock chain node holding a fixed set of known transactions
struct MockChain {
    senders: HashMap<TxHash, Address>,
    lookup_fails: bool,
    submit_fails: bool,
    transfers: Mutex<Vec<(Address, U256)>>,
    lookups: Mutex<usize>,
    next_nonce: Mutex<u8>,
}

impl MockChain {
    fn new() -> Self {
        Self {
            senders: HashMap::new(),
            lookup_fails: false,
            submit_fails: false,
            transfers: Mutex::new(Vec::new()),
            lookups: Mutex::new(0),
            next_nonce: Mutex::new(0xe0),
        }
    }

    fn with_transaction(mut self, hash: TxHash, from: Address) -> Self {
        self.senders.insert(hash, from);
        self
    }

    fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    fn lookup_count(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn transaction_sender(&self, hash: TxHash) -> Result<Option<Address>, ChainError> {
        *self.lookups.lock().unwrap() += 1;
        // Give concurrent tasks a chance to interleave.
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.lookup_fails {
            return Err(ChainError::Rpc("node unavailable".to_string()));
        }
        Ok(self.senders.get(&hash).copied())
    }
}

#[async_trait]
impl ChainWriter for MockChain {
    async fn send_transfer(&self, to: Address, amount: U256) -> Result<PendingTransfer, ChainError> {
        if self.submit_fails {
            return Err(ChainError::Submission("insufficient funds".to_string()));
        }
        self.transfers.lock().unwrap().push((to, amount));
        let mut nonce = self.next_nonce.lock().unwrap();
        *nonce += 1;
        Ok(PendingTransfer {
            tx_hash: TxHash::repeat_byte(*nonce),
            to,
            amount,
        })
    }

    async fn await_confirmation(&self, pending: PendingTransfer) -> Result<TransferReceipt, ChainError> {
        Ok(TransferReceipt {
            tx_hash: pending.tx_hash,
            block_number: Some(100),
        })
    }
}

/// Mock reply channel that captures posted replies
#[derive(Default)]
struct MockReplies {
    primary_fails: bool,
    fallback_fails: bool,
    primary_calls: Mutex<Vec<(String, String)>>,
    fallback_calls: Mutex<Vec<(String, String)>>,
}

impl MockReplies {
    fn failing(primary_fails: bool, fallback_fails: bool) -> Self {
        Self {
            primary_fails,
            fallback_fails,
            ..Default::default()
        }
    }

    fn primary_count(&self) -> usize {
        self.primary_calls.lock().unwrap().len()
    }

    fn fallback_count(&self) -> usize {
        self.fallback_calls.lock().unwrap().len()
    }

    fn all_texts(&self) -> Vec<String> {
        let primary = self.primary_calls.lock().unwrap();
        let fallback = self.fallback_calls.lock().unwrap();
        primary.iter().chain(fallback.iter()).map(|(text, _)| text.clone()).collect()
    }
}

fn rejected() -> FeedError {
    FeedError::Status {
        status: 503,
        body: "Service Unavailable".to_string(),
    }
}

#[async_trait]
impl ReplyChannel for MockReplies {
    async fn reply(&self, text: &str, mention_id: &str) -> Result<String, FeedError> {
        self.primary_calls
            .lock()
            .unwrap()
            .push((text.to_string(), mention_id.to_string()));
        if self.primary_fails {
            return Err(rejected());
        }
        Ok(format!("reply-{}", mention_id))
    }

    async fn post(&self, text: &str, in_reply_to: &str) -> Result<String, FeedError> {
        self.fallback_calls
            .lock()
            .unwrap()
            .push((text.to_string(), in_reply_to.to_string()));
        if self.fallback_fails {
            return Err(rejected());
        }
        Ok(format!("post-{}", in_reply_to))
    }
}

/// Mock feed that replays queued batches, then ends
struct MockFeed {
    batches: VecDeque<Vec<Mention>>,
}

impl MockFeed {
    fn new(batches: Vec<Vec<Mention>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

#[async_trait]
impl MentionSource for MockFeed {
    async fn next_batch(&mut self) -> Option<Vec<Mention>> {
        self.batches.pop_front()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

fn build(chain: Arc<MockChain>, replies: Arc<MockReplies>) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(
        TransactionResolver::new(chain.clone()),
        TipDispatcher::new(chain),
        ReplyNotifier::new(replies),
        CoordinatorSettings {
            explorer_url: EXPLORER.to_string(),
            ..Default::default()
        },
    ))
}

// ==================== Happy Path Tests ====================

#[tokio::test]
async fn test_mention_completes_with_one_reply() {
    let wallet = Address::repeat_byte(0x11);
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), wallet));
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies.clone());

    let outcome = coordinator.handle_mention(&mention_for("100", tx_hash(0xaa))).await;

    let confirmation = outcome.confirmation_hash().expect("mention should complete");
    assert_eq!(chain.transfer_count(), 1);
    assert_eq!(chain.transfers.lock().unwrap()[0].0, wallet);
    assert_eq!(replies.primary_count(), 1);
    assert_eq!(replies.fallback_count(), 0);

    let (text, mention_id) = replies.primary_calls.lock().unwrap()[0].clone();
    assert_eq!(mention_id, "100");
    assert!(text.contains(&format!("{}/tx/{:#x}", EXPLORER, confirmation)));
}

#[tokio::test]
async fn test_bare_hash_mention_completes() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xab), Address::repeat_byte(0x22)));
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies);

    let mention = Mention::new("101", "author", format!("tipped? {:#x}", tx_hash(0xab)));
    let outcome = coordinator.handle_mention(&mention).await;

    assert_eq!(outcome.kind(), "completed");
    assert_eq!(chain.transfer_count(), 1);
}

// ==================== Duplicate Delivery Tests ====================

#[tokio::test]
async fn test_duplicate_delivery_is_skipped() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies.clone());
    let mention = mention_for("100", tx_hash(0xaa));

    coordinator.handle_mention(&mention).await;
    let second = coordinator.handle_mention(&mention).await;

    assert_eq!(second, MentionOutcome::SkippedDuplicate);
    assert_eq!(chain.transfer_count(), 1);
    assert_eq!(chain.lookup_count(), 1);
    assert_eq!(replies.primary_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_mention_in_one_batch_dispatches_once() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));
    let batch = vec![mention_for("100", tx_hash(0xaa)); 6];

    let outcomes = coordinator.process_batch(batch, &CancellationToken::new()).await;

    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes.iter().filter(|o| o.kind() == "completed").count(), 1);
    assert_eq!(chain.transfer_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_mentions_same_hash_dispatch_once() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));
    let batch: Vec<Mention> = (0..10)
        .map(|i| mention_for(&format!("m{}", i), tx_hash(0xaa)))
        .collect();

    let outcomes = coordinator.process_batch(batch, &CancellationToken::new()).await;

    assert_eq!(chain.transfer_count(), 1);
    assert_eq!(
        outcomes.iter().filter(|o| **o == MentionOutcome::SkippedDuplicate).count(),
        9
    );
    for i in 0..10 {
        assert!(coordinator.dedup().has(&format!("m{}", i)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_hashes_all_tipped() {
    let mut chain = MockChain::new();
    for byte in 1..=5u8 {
        chain = chain.with_transaction(tx_hash(byte), Address::repeat_byte(byte));
    }
    let chain = Arc::new(chain);
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));
    let batch: Vec<Mention> = (1..=5u8)
        .map(|byte| mention_for(&byte.to_string(), tx_hash(byte)))
        .collect();

    let outcomes = coordinator.process_batch(batch, &CancellationToken::new()).await;

    assert!(outcomes.iter().all(|o| o.kind() == "completed"));
    assert_eq!(chain.transfer_count(), 5);
}

// ==================== Skip Path Tests ====================

#[tokio::test]
async fn test_no_reference_makes_no_chain_calls() {
    let chain = Arc::new(MockChain::new());
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies.clone());

    let outcome = coordinator
        .handle_mention(&Mention::new("1", "a", "@bot gm, no link today"))
        .await;

    assert_eq!(outcome, MentionOutcome::SkippedNoReference);
    assert_eq!(chain.lookup_count(), 0);
    assert_eq!(chain.transfer_count(), 0);
    assert_eq!(replies.primary_count(), 0);
}

#[tokio::test]
async fn test_unknown_transaction_is_unresolved() {
    let chain = Arc::new(MockChain::new());
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));

    let outcome = coordinator.handle_mention(&mention_for("1", tx_hash(0x77))).await;

    assert_eq!(outcome, MentionOutcome::SkippedUnresolved);
    assert_eq!(chain.transfer_count(), 0);
    assert!(coordinator.dedup().has("1"));
}

#[tokio::test]
async fn test_lookup_failure_is_unresolved_and_final() {
    let mut chain = MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11));
    chain.lookup_fails = true;
    let chain = Arc::new(chain);
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));
    let mention = mention_for("1", tx_hash(0xaa));

    assert_eq!(coordinator.handle_mention(&mention).await, MentionOutcome::SkippedUnresolved);
    assert_eq!(coordinator.handle_mention(&mention).await, MentionOutcome::SkippedDuplicate);
    assert_eq!(chain.lookup_count(), 1);
}

// ==================== Failure Path Tests ====================

#[tokio::test]
async fn test_dispatch_failure_sends_no_reply() {
    let mut chain = MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11));
    chain.submit_fails = true;
    let chain = Arc::new(chain);
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies.clone());

    let outcome = coordinator.handle_mention(&mention_for("1", tx_hash(0xaa))).await;

    match outcome {
        MentionOutcome::FailedDispatch(tip) => {
            assert!(tip.failure_reason().unwrap().contains("insufficient funds"));
        }
        other => panic!("expected FailedDispatch, got {:?}", other),
    }
    assert_eq!(replies.primary_count(), 0);
    assert_eq!(replies.fallback_count(), 0);
}

#[tokio::test]
async fn test_failed_dispatch_hash_is_not_retried() {
    let mut chain = MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11));
    chain.submit_fails = true;
    let chain = Arc::new(chain);
    let coordinator = build(chain.clone(), Arc::new(MockReplies::default()));

    coordinator.handle_mention(&mention_for("1", tx_hash(0xaa))).await;
    let retry = coordinator.handle_mention(&mention_for("2", tx_hash(0xaa))).await;

    assert_eq!(retry, MentionOutcome::SkippedDuplicate);
}

#[tokio::test]
async fn test_primary_reply_failure_uses_fallback_once() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let replies = Arc::new(MockReplies::failing(true, false));
    let coordinator = build(chain, replies.clone());

    let outcome = coordinator.handle_mention(&mention_for("1", tx_hash(0xaa))).await;

    match outcome {
        MentionOutcome::Completed { notification, .. } => {
            assert!(notification.delivered);
            assert_eq!(notification.method, DeliveryMethod::Fallback);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    assert_eq!(replies.primary_count(), 1);
    assert_eq!(replies.fallback_count(), 1);
    assert_eq!(replies.fallback_calls.lock().unwrap()[0].1, "1");
}

#[tokio::test]
async fn test_both_replies_fail_tip_stands() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let replies = Arc::new(MockReplies::failing(true, true));
    let coordinator = build(chain.clone(), replies.clone());

    let outcome = coordinator.handle_mention(&mention_for("1", tx_hash(0xaa))).await;

    assert_eq!(outcome.kind(), "completed");
    assert_eq!(chain.transfer_count(), 1);
    assert_eq!(replies.primary_count(), 1);
    assert_eq!(replies.fallback_count(), 1);
    assert!(replies.all_texts().iter().all(|t| t.contains("tip of 1 tokens")));
}

// ==================== Run Loop Tests ====================

#[tokio::test]
async fn test_run_over_redelivering_feed() {
    let chain = Arc::new(MockChain::new().with_transaction(tx_hash(0xaa), Address::repeat_byte(0x11)));
    let replies = Arc::new(MockReplies::default());
    let coordinator = build(chain.clone(), replies.clone());
    let feed = MockFeed::new(vec![
        vec![mention_for("1", tx_hash(0xaa)), Mention::new("2", "a", "gm")],
        vec![],
        vec![mention_for("1", tx_hash(0xaa)), Mention::new("2", "a", "gm")],
    ]);

    let stats = coordinator.run(feed, CancellationToken::new()).await;

    assert_eq!(stats.received, 4);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.skipped_no_reference, 1);
    assert_eq!(stats.skipped_duplicate, 2);
    assert_eq!(chain.transfer_count(), 1);
    assert_eq!(replies.primary_count(), 1);
}
