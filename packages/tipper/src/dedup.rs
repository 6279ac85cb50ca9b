//! Deduplication
//!
//! Bounded memory of what the pipeline has already handled. Mention ids go
//! through a check-and-claim gate so two deliveries of the same mention can
//! never both proceed; dispatched transaction hashes are remembered so a
//! second mention of an already-tipped transaction is skipped; and a keyed
//! async lock serializes work per transaction hash.

use alloy::primitives::TxHash;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Default number of identifiers retained before the oldest are evicted
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Insertion-ordered set with a fixed capacity.
///
/// Once the capacity is exceeded the oldest entries are evicted first, so
/// the most recently inserted identifiers are always the ones retained.
#[derive(Debug, Clone)]
pub struct ProcessedSet<K> {
    order: VecDeque<K>,
    members: HashSet<K>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone> ProcessedSet<K> {
    /// Create an empty set. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Insert a key, evicting the oldest entries beyond capacity
    ///
    /// # Returns
    /// `true` if the key was newly inserted, `false` if it was already present
    /// (its position in the eviction order is left unchanged)
    pub fn insert(&mut self, key: K) -> bool {
        if !self.members.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
struct DedupState {
    processed: ProcessedSet<String>,
    in_flight: HashSet<String>,
}

fn lock_state(state: &Mutex<DedupState>) -> MutexGuard<'_, DedupState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mention-id dedup gate shared by every pipeline task.
///
/// Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    state: Arc<Mutex<DedupState>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DedupState {
                processed: ProcessedSet::new(capacity),
                in_flight: HashSet::new(),
            })),
        }
    }

    /// Whether a mention has already reached a terminal state
    pub fn has(&self, mention_id: &str) -> bool {
        lock_state(&self.state).processed.contains(&mention_id.to_string())
    }

    /// Record a mention as handled
    pub fn mark_processed(&self, mention_id: &str) {
        let mut state = lock_state(&self.state);
        state.in_flight.remove(mention_id);
        state.processed.insert(mention_id.to_string());
    }

    /// Atomically check a mention and claim it for processing.
    ///
    /// # Returns
    /// `None` if the mention was already processed or is being processed by
    /// another task; otherwise a claim that must be completed once the
    /// mention's outcome is determinate
    pub fn try_claim(&self, mention_id: &str) -> Option<MentionClaim> {
        let mut state = lock_state(&self.state);
        let id = mention_id.to_string();
        if state.processed.contains(&id) || state.in_flight.contains(&id) {
            return None;
        }
        state.in_flight.insert(id.clone());

        Some(MentionClaim {
            mention_id: id,
            state: Arc::clone(&self.state),
            completed: false,
        })
    }

    pub fn is_in_flight(&self, mention_id: &str) -> bool {
        lock_state(&self.state).in_flight.contains(mention_id)
    }

    /// Number of processed ids currently retained
    pub fn len(&self) -> usize {
        lock_state(&self.state).processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock_state(&self.state).processed.capacity()
    }
}

/// Exclusive right to process one mention id.
///
/// Dropping an uncompleted claim releases the id without marking it
/// processed, so a later delivery may pick it up again.
#[derive(Debug)]
pub struct MentionClaim {
    mention_id: String,
    state: Arc<Mutex<DedupState>>,
    completed: bool,
}

impl MentionClaim {
    pub fn mention_id(&self) -> &str {
        &self.mention_id
    }

    /// Mark the claimed mention as processed and release the claim
    pub fn complete(mut self) {
        let mut state = lock_state(&self.state);
        state.in_flight.remove(&self.mention_id);
        state.processed.insert(self.mention_id.clone());
        self.completed = true;
    }
}

impl Drop for MentionClaim {
    fn drop(&mut self) {
        if !self.completed {
            lock_state(&self.state).in_flight.remove(&self.mention_id);
        }
    }
}

/// Bounded record of transaction hashes that have already been tipped
#[derive(Debug, Clone)]
pub struct TipLedger {
    tipped: Arc<Mutex<ProcessedSet<TxHash>>>,
}

impl TipLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            tipped: Arc::new(Mutex::new(ProcessedSet::new(capacity))),
        }
    }

    pub fn contains(&self, hash: &TxHash) -> bool {
        self.tipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
    }

    pub fn record(&self, hash: TxHash) -> bool {
        self.tipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash)
    }

    pub fn len(&self) -> usize {
        self.tipped.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Async mutual exclusion keyed by an arbitrary value
#[derive(Debug)]
pub struct KeyedLocks<K> {
    locks: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K> Clone for KeyedLocks<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop entries nobody holds or waits on
    ///
    /// # Returns
    /// The number of entries removed
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
