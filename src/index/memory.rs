use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{IndexEntry, IndexProvider, IndexTransaction, RestoreDocs};
use crate::types::{Result, UmbralError};

type Stores = BTreeMap<String, BTreeMap<String, Vec<IndexEntry>>>;

struct Shared {
    name: String,
    stores: RwLock<Stores>,
    commits: AtomicU64,
    failing_commits: AtomicUsize,
}

/// In-memory index backend.
#[derive(Clone)]
pub struct MemoryIndex {
    shared: Arc<Shared>,
}

impl MemoryIndex {
    /// Creates an empty backend called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                stores: RwLock::new(BTreeMap::new()),
                commits: AtomicU64::new(0),
                failing_commits: AtomicUsize::new(0),
            }),
        }
    }

    /// Fields of a document, if present.
    pub fn document(&self, store: &str, doc_id: &str) -> Option<Vec<IndexEntry>> {
        self.shared
            .stores
            .read()
            .get(store)
            .and_then(|docs| docs.get(doc_id))
            .cloned()
    }

    /// Number of documents in `store`.
    pub fn len(&self, store: &str) -> usize {
        self.shared.stores.read().get(store).map_or(0, BTreeMap::len)
    }

    /// Whether `store` holds no documents.
    pub fn is_empty(&self, store: &str) -> bool {
        self.len(store) == 0
    }

    /// Number of successful commits.
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Makes the next `n` commits fail with a temporary error.
    pub fn fail_commits(&self, n: usize) {
        self.shared.failing_commits.store(n, Ordering::SeqCst);
    }
}

impl IndexProvider for MemoryIndex {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn begin_transaction(&self) -> Result<Box<dyn IndexTransaction>> {
        Ok(Box::new(MemoryIndexTx {
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
        }))
    }
}

struct MemoryIndexTx {
    shared: Arc<Shared>,
    pending: Vec<RestoreDocs>,
}

impl IndexTransaction for MemoryIndexTx {
    fn restore(&mut self, docs: RestoreDocs) -> Result<()> {
        self.pending.push(docs);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let failing = self
            .shared
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(UmbralError::TemporaryBackend(format!(
                "index {} unavailable",
                self.shared.name
            )));
        }
        let mut stores = self.shared.stores.write();
        let mut written = 0usize;
        for batch in self.pending {
            for (store, docs) in batch {
                let target = stores.entry(store).or_default();
                for (doc_id, entries) in docs {
                    if entries.is_empty() {
                        target.remove(&doc_id);
                    } else {
                        target.insert(doc_id, entries);
                    }
                    written += 1;
                }
            }
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        debug!(index = %self.shared.name, docs = written, "index.commit");
        Ok(())
    }

    fn rollback(self: Box<Self>) {}
}
