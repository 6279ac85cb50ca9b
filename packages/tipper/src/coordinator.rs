//! Pipeline Coordinator
//!
//! Drives each mention through extract, resolve, dispatch and notify, and
//! owns the invariants that matter: a mention id is handled at most once, and
//! a transaction hash is tipped at most once. Mentions in a batch run
//! concurrently up to a bound; work on the same transaction hash is
//! serialized by a per-hash lock.

use alloy::primitives::{TxHash, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dedup::{Deduplicator, KeyedLocks, TipLedger, DEFAULT_DEDUP_CAPACITY};
use crate::dispatcher::{TipDispatcher, TipOutcome};
use crate::feed::{Mention, MentionSource};
use crate::notifier::{display_amount, format_reply, NotificationOutcome, ReplyNotifier};
use crate::resolver::TransactionResolver;

/// Default number of mentions handled concurrently within a batch
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Default spacing of the cleanup task
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Terminal state of one mention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MentionOutcome {
    /// The mention id, or the transaction it references, was already handled
    SkippedDuplicate,
    SkippedNoReference,
    /// The transaction was not found or could not be looked up
    SkippedUnresolved,
    Completed {
        tip: TipOutcome,
        notification: NotificationOutcome,
    },
    FailedDispatch(TipOutcome),
}

impl MentionOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            MentionOutcome::SkippedDuplicate => "skipped_duplicate",
            MentionOutcome::SkippedNoReference => "skipped_no_reference",
            MentionOutcome::SkippedUnresolved => "skipped_unresolved",
            MentionOutcome::Completed { .. } => "completed",
            MentionOutcome::FailedDispatch(_) => "failed_dispatch",
        }
    }

    /// Confirmation hash of the tip, for completed mentions
    pub fn confirmation_hash(&self) -> Option<TxHash> {
        match self {
            MentionOutcome::Completed { tip, .. } => tip.confirmation_hash(),
            _ => None,
        }
    }
}

/// Counters of terminal outcomes since startup
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    skipped_duplicate: AtomicU64,
    skipped_no_reference: AtomicU64,
    skipped_unresolved: AtomicU64,
    completed: AtomicU64,
    failed_dispatch: AtomicU64,
    undelivered_replies: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub skipped_duplicate: u64,
    pub skipped_no_reference: u64,
    pub skipped_unresolved: u64,
    pub completed: u64,
    pub failed_dispatch: u64,
    pub undelivered_replies: u64,
    pub panicked: u64,
}

impl PipelineStats {
    fn record(&self, outcome: &MentionOutcome) {
        let counter = match outcome {
            MentionOutcome::SkippedDuplicate => &self.skipped_duplicate,
            MentionOutcome::SkippedNoReference => &self.skipped_no_reference,
            MentionOutcome::SkippedUnresolved => &self.skipped_unresolved,
            MentionOutcome::Completed { notification, .. } => {
                if !notification.delivered {
                    self.undelivered_replies.fetch_add(1, Ordering::Relaxed);
                }
                &self.completed
            }
            MentionOutcome::FailedDispatch(_) => &self.failed_dispatch,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            skipped_duplicate: self.skipped_duplicate.load(Ordering::Relaxed),
            skipped_no_reference: self.skipped_no_reference.load(Ordering::Relaxed),
            skipped_unresolved: self.skipped_unresolved.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed_dispatch: self.failed_dispatch.load(Ordering::Relaxed),
            undelivered_replies: self.undelivered_replies.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Tip size in wei
    pub tip_amount: U256,
    /// Explorer base used in reply links
    pub explorer_url: String,
    pub dedup_capacity: usize,
    pub max_in_flight: usize,
    pub cleanup_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            tip_amount: U256::from(10u64).pow(U256::from(18u64)),
            explorer_url: "https://aeneid.storyscan.xyz".to_string(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

pub struct Coordinator {
    dedup: Deduplicator,
    tipped: TipLedger,
    hash_locks: KeyedLocks<TxHash>,
    resolver: TransactionResolver,
    dispatcher: TipDispatcher,
    notifier: ReplyNotifier,
    settings: CoordinatorSettings,
    stats: PipelineStats,
}

impl Coordinator {
    pub fn new(
        resolver: TransactionResolver,
        dispatcher: TipDispatcher,
        notifier: ReplyNotifier,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            dedup: Deduplicator::new(settings.dedup_capacity),
            tipped: TipLedger::new(settings.dedup_capacity),
            hash_locks: KeyedLocks::new(),
            resolver,
            dispatcher,
            notifier,
            settings,
            stats: PipelineStats::default(),
        }
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn tipped(&self) -> &TipLedger {
        &self.tipped
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Run one mention to its terminal state
    pub async fn handle_mention(&self, mention: &Mention) -> MentionOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.dedup.try_claim(&mention.id) {
            Some(claim) => {
                let outcome = self.advance(mention).await;
                claim.complete();
                outcome
            }
            None => {
                debug!(mention_id = %mention.id, "Mention already handled");
                MentionOutcome::SkippedDuplicate
            }
        };

        self.stats.record(&outcome);
        info!(mention_id = %mention.id, outcome = outcome.kind(), "Mention handled");
        outcome
    }

    async fn advance(&self, mention: &Mention) -> MentionOutcome {
        let Some(reference) = self.resolver.extract_reference(&mention.text) else {
            debug!(mention_id = %mention.id, "No transaction reference in mention");
            return MentionOutcome::SkippedNoReference;
        };
        let hash = reference.hash();

        let guard = self.hash_locks.lock(hash).await;

        if self.tipped.contains(&hash) {
            info!(mention_id = %mention.id, tx_hash = %reference, "Transaction already tipped");
            return MentionOutcome::SkippedDuplicate;
        }

        let resolved = match self.resolver.resolve(reference).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return MentionOutcome::SkippedUnresolved,
            Err(e) => {
                error!(mention_id = %mention.id, tx_hash = %reference, error = %e, "Transaction lookup failed");
                return MentionOutcome::SkippedUnresolved;
            }
        };

        // Recorded before submission: an indeterminate transfer still counts.
        self.tipped.record(hash);
        let tip = self
            .dispatcher
            .dispatch(resolved.originator, self.settings.tip_amount)
            .await;
        drop(guard);

        let Some(confirmation) = tip.confirmation_hash() else {
            return MentionOutcome::FailedDispatch(tip);
        };

        let message = format_reply(
            &display_amount(self.settings.tip_amount),
            &self.settings.explorer_url,
            confirmation,
        );
        let notification = self.notifier.notify(&mention.id, &message).await;

        MentionOutcome::Completed { tip, notification }
    }

    /// Handle a batch with bounded concurrency and wait for all of it.
    ///
    /// Mentions not yet started when `shutdown` fires are left unclaimed.
    pub async fn process_batch(
        self: &Arc<Self>,
        batch: Vec<Mention>,
        shutdown: &CancellationToken,
    ) -> Vec<MentionOutcome> {
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();

        for mention in batch {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let coordinator = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                coordinator.handle_mention(&mention).await
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "Mention task failed");
                }
            }
        }
        outcomes
    }

    /// Prune idle hash locks and report occupancy
    pub fn cleanup(&self) -> usize {
        let pruned = self.hash_locks.prune();
        info!(
            pruned_locks = pruned,
            processed = self.dedup.len(),
            tipped = self.tipped.len(),
            "Cleanup complete"
        );
        pruned
    }

    fn spawn_cleanup(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = coordinator.settings.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = ticker.tick() => {
                        coordinator.cleanup();
                    }
                }
            }
        })
    }

    /// Consume `source` until it ends or `shutdown` fires.
    ///
    /// Each batch is fully handled before the next one is requested.
    ///
    /// # Returns
    /// Final outcome counters
    pub async fn run<S>(self: Arc<Self>, mut source: S, shutdown: CancellationToken) -> StatsSnapshot
    where
        S: MentionSource,
    {
        info!(source = source.name(), "Coordinator started");
        let cleanup_stop = shutdown.child_token();
        let cleanup = self.spawn_cleanup(cleanup_stop.clone());

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping mention source");
                    break;
                }
                batch = source.next_batch() => batch,
            };

            let Some(batch) = batch else {
                warn!(source = source.name(), "Mention source ended");
                break;
            };
            if batch.is_empty() {
                continue;
            }

            debug!(count = batch.len(), "Processing mention batch");
            self.process_batch(batch, &shutdown).await;
        }

        cleanup_stop.cancel();
        if let Err(e) = cleanup.await {
            error!(error = %e, "Cleanup task failed");
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            completed = stats.completed,
            failed_dispatch = stats.failed_dispatch,
            skipped_duplicate = stats.skipped_duplicate,
            skipped_no_reference = stats.skipped_no_reference,
            skipped_unresolved = stats.skipped_unresolved,
            undelivered_replies = stats.undelivered_replies,
            "Coordinator stopped"
        );
        stats
    }
}
