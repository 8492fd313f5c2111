use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::trace;

use super::entry::{TxEntry, TxSnapshot};
use crate::primitives::clock::TimeSource;
use crate::types::{Timestamp, TransactionId};

/// Callback receiving every evicted transaction with its final state.
pub type EvictionListener = Box<dyn Fn(TransactionId, TxSnapshot) + Send + Sync>;

struct Cached {
    created: Timestamp,
    entry: Arc<TxEntry>,
}

/// Time-bounded map from transaction id to [`TxEntry`].
///
/// Entries live for a fixed time after creation. Expired entries are evicted
/// when their key is next accessed or by [`TxCache::clean_up`]; either way the
/// eviction listener sees each entry exactly once.
pub struct TxCache {
    entries: DashMap<TransactionId, Cached>,
    lifetime: Duration,
    clock: Arc<dyn TimeSource>,
    listener: EvictionListener,
}

impl TxCache {
    /// Creates a cache whose entries expire `lifetime` after creation.
    pub fn new(lifetime: Duration, clock: Arc<dyn TimeSource>, listener: EvictionListener) -> Self {
        Self {
            entries: DashMap::new(),
            lifetime,
            clock,
            listener,
        }
    }

    fn expired(&self, cached: &Cached, now: Timestamp) -> bool {
        cached.created.plus(self.lifetime) <= now
    }

    fn evict(&self, id: &TransactionId, now: Timestamp) -> bool {
        match self
            .entries
            .remove_if(id, |_, cached| self.expired(cached, now))
        {
            Some((id, cached)) => {
                trace!(tx = %id, "recovery.cache.evict");
                (self.listener)(id, cached.entry.snapshot());
                true
            }
            None => false,
        }
    }

    /// Returns the live entry for `id`, creating it if absent or expired.
    pub fn get_or_create(&self, id: &TransactionId) -> Arc<TxEntry> {
        let now = self.clock.now();
        self.evict(id, now);
        let cached = self.entries.entry(id.clone()).or_insert_with(|| Cached {
            created: now,
            entry: Arc::new(TxEntry::new()),
        });
        Arc::clone(&cached.entry)
    }

    /// Live entry for `id` without creating one.
    pub fn get(&self, id: &TransactionId) -> Option<Arc<TxEntry>> {
        let now = self.clock.now();
        self.evict(id, now);
        self.entries.get(id).map(|cached| Arc::clone(&cached.entry))
    }

    /// Evicts every expired entry; returns how many were evicted.
    pub fn clean_up(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<TransactionId> = self
            .entries
            .iter()
            .filter(|item| self.expired(item.value(), now))
            .map(|item| item.key().clone())
            .collect();
        expired.iter().filter(|id| self.evict(id, now)).count()
    }

    /// Number of cached transactions, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
