use std::fmt::Debug;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, trace};

use super::key_column::KeyColumn;
use crate::primitives::clock::TimeSource;
use crate::types::Timestamp;

/// Local holder of a coordinate and the time its hold lapses.
///
/// Equality is by holder only.
#[derive(Clone, Debug)]
struct AuditRecord<H> {
    holder: H,
    expires: Timestamp,
}

impl<H: PartialEq> PartialEq for AuditRecord<H> {
    fn eq(&self, other: &Self) -> bool {
        self.holder == other.holder
    }
}

/// In-process arbiter for lock coordinates.
///
/// Resolves contention between transactions of the same process before any
/// claim reaches the store. Every operation is a single atomic map update and
/// never waits on another caller.
pub struct LocalLockMediator<H> {
    name: String,
    clock: Arc<dyn TimeSource>,
    locks: DashMap<KeyColumn, AuditRecord<H>>,
}

impl<H> LocalLockMediator<H>
where
    H: Clone + Eq + Debug + Send + Sync,
{
    /// Creates a mediator for namespace `name`.
    pub fn new(name: impl Into<String>, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            name: name.into(),
            clock,
            locks: DashMap::new(),
        }
    }

    /// Namespace this mediator arbitrates.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes or refreshes the local hold on `kc` until `expires`.
    ///
    /// Succeeds when the coordinate is free, already held by `holder`, or held by
    /// someone whose hold has lapsed.
    pub fn lock(&self, kc: &KeyColumn, holder: &H, expires: Timestamp) -> bool {
        let record = AuditRecord {
            holder: holder.clone(),
            expires,
        };
        let granted = match self.locks.entry(kc.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if *current == record || current.expires <= self.clock.now() {
                    slot.insert(record);
                    true
                } else {
                    false
                }
            }
        };
        trace!(mediator = %self.name, %kc, ?holder, granted, "mediator.lock");
        granted
    }

    /// Releases `kc` if `holder` currently holds it.
    pub fn unlock(&self, kc: &KeyColumn, holder: &H) -> bool {
        if self
            .locks
            .remove_if(kc, |_, record| record.holder == *holder)
            .is_some()
        {
            trace!(mediator = %self.name, %kc, ?holder, "mediator.unlock");
            return true;
        }
        match self.locks.get(kc) {
            Some(current) => error!(
                mediator = %self.name,
                %kc,
                requester = ?holder,
                holder = ?current.holder,
                "mediator.unlock.not_holder"
            ),
            None => error!(mediator = %self.name, %kc, requester = ?holder, "mediator.unlock.not_held"),
        }
        false
    }

    /// Current holder of `kc`, if any and not lapsed.
    pub fn holder(&self, kc: &KeyColumn) -> Option<H> {
        let now = self.clock.now();
        self.locks
            .get(kc)
            .filter(|record| record.expires > now)
            .map(|record| record.holder.clone())
    }
}

/// Owner of the mediators of one process, keyed by namespace.
///
/// Lockers sharing a registry and namespace exclude each other locally.
pub struct MediatorRegistry<H> {
    clock: Arc<dyn TimeSource>,
    mediators: DashMap<String, Arc<LocalLockMediator<H>>>,
}

impl<H> MediatorRegistry<H>
where
    H: Clone + Eq + Debug + Send + Sync,
{
    /// Creates an empty registry whose mediators read time from `clock`.
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            clock,
            mediators: DashMap::new(),
        }
    }

    /// Returns the mediator for `namespace`, creating it on first use.
    pub fn get(&self, namespace: &str) -> Arc<LocalLockMediator<H>> {
        self.mediators
            .entry(namespace.to_string())
            .or_insert_with(|| {
                Arc::new(LocalLockMediator::new(namespace, Arc::clone(&self.clock)))
            })
            .clone()
    }

    /// Clock shared by this registry's mediators.
    pub fn clock(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.clock)
    }
}
