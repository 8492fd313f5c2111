use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::entry::TxSnapshot;
use crate::config::RecoveryOptions;
use crate::graph::{ElementCategory, ElementId, GraphProvider, IndexId, RelationKind};
use crate::index::RestoreDocs;
use crate::log::{LogEntry, LogManager, TransactionLogHeader};
use crate::primitives::clock::TimeSource;
use crate::primitives::retry;
use crate::types::{Result, TransactionId};

/// An element to re-serialize into one mixed index.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct IndexRestore {
    element_id: ElementId,
    index_id: IndexId,
    category: ElementCategory,
}

/// What a repair did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Backing indexes whose documents were restored.
    pub restored_indexes: Vec<String>,
    /// User log that received a fresh copy of the commit.
    pub redelivered_to: Option<String>,
    /// The commit record was never seen, so nothing was replayed.
    pub skipped: bool,
}

/// Replays partially failed transactions into external indexes and user logs.
///
/// Every action is derived from the current graph state, so repeating a repair
/// leaves indexes unchanged.
pub struct RepairPipeline {
    graph: Arc<dyn GraphProvider>,
    logs: Arc<dyn LogManager>,
    clock: Arc<dyn TimeSource>,
    options: RecoveryOptions,
    tx_counter: AtomicU64,
}

impl RepairPipeline {
    /// Creates a pipeline reading from `graph` and appending through `logs`.
    pub fn new(
        graph: Arc<dyn GraphProvider>,
        logs: Arc<dyn LogManager>,
        clock: Arc<dyn TimeSource>,
        options: RecoveryOptions,
    ) -> Self {
        Self {
            graph,
            logs,
            clock,
            options,
            tx_counter: AtomicU64::new(0),
        }
    }

    fn notice(&self, tx: &TransactionId, what: &str) {
        if self.options.verbose {
            info!(tx = %tx, "{what}");
        } else {
            debug!(tx = %tx, "{what}");
        }
    }

    /// Repairs transaction `tx_id` given its final recovery state.
    ///
    /// Without failure detail both the indexes and the user log are repaired.
    /// Index and log repairs run independently; the first error is returned
    /// after both have been attempted.
    pub fn repair(&self, tx_id: &TransactionId, state: &TxSnapshot) -> Result<RepairReport> {
        self.notice(tx_id, "recovery.repair.start");
        let Some(commit) = state.entry.as_ref() else {
            self.notice(tx_id, "recovery.repair.no_commit_record");
            return Ok(RepairReport {
                skipped: true,
                ..RepairReport::default()
            });
        };

        let (user_log_failure, index_failure, failed) = match &state.failures {
            Some(f) => (
                f.user_log_failure,
                !f.failed_indexes.is_empty(),
                Some(&f.failed_indexes),
            ),
            None => (true, true, None),
        };
        let is_failed = |backing: &str| failed.map_or(true, |set| set.contains(backing));

        let mut report = RepairReport::default();
        let mut first_err = None;

        if index_failure {
            match self.restore_external_indexes(tx_id, commit, &is_failed) {
                Ok(restored) => report.restored_indexes = restored,
                Err(err) => first_err = Some(err),
            }
        }

        if let Some(log_id) = commit.metadata.log_id.as_deref().filter(|_| user_log_failure) {
            match self.redeliver(tx_id, commit, log_id) {
                Ok(()) => report.redelivered_to = Some(log_id.to_string()),
                Err(err) => {
                    warn!(tx = %tx_id, log = log_id, error = %err, "recovery.repair.user_log_failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => {
                self.notice(tx_id, "recovery.repair.done");
                Ok(report)
            }
        }
    }

    fn collect_restores(
        &self,
        commit: &LogEntry,
        is_failed: &dyn Fn(&str) -> bool,
    ) -> Result<BTreeMap<String, BTreeSet<IndexRestore>>> {
        let tx = self.graph.begin()?;
        let collected = (|| -> Result<BTreeMap<String, BTreeSet<IndexRestore>>> {
            let mut restores: BTreeMap<String, BTreeSet<IndexRestore>> = BTreeMap::new();
            for modification in commit.modifications()? {
                let rel =
                    tx.parse_relation(modification.out_vertex_id, &modification.relation_cell)?;
                // Vertex indexes covering the property's key.
                if rel.kind == RelationKind::Property {
                    for index in tx.mixed_indexes(rel.type_id)? {
                        if index.element == ElementCategory::Vertex
                            && is_failed(&index.backing_index)
                        {
                            restores.entry(index.backing_index).or_default().insert(
                                IndexRestore {
                                    element_id: ElementId::Vertex(rel.out_vertex),
                                    index_id: index.id,
                                    category: ElementCategory::Vertex,
                                },
                            );
                        }
                    }
                }
                // Indexes over the relation's own properties.
                for key in rel.properties.keys() {
                    for index in tx.mixed_indexes(*key)? {
                        if index.element == rel.category() && is_failed(&index.backing_index) {
                            restores.entry(index.backing_index).or_default().insert(
                                IndexRestore {
                                    element_id: ElementId::Relation(rel.id),
                                    index_id: index.id,
                                    category: rel.category(),
                                },
                            );
                        }
                    }
                }
            }
            Ok(restores)
        })();
        tx.rollback();
        collected
    }

    fn restore_external_indexes(
        &self,
        tx_id: &TransactionId,
        commit: &LogEntry,
        is_failed: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let clock = self.clock.as_ref();
        let restores = retry::execute(clock, "recovery.collect", self.options.read_time, || {
            self.collect_restores(commit, is_failed)
        })?;

        let mut restored = Vec::new();
        let mut first_err = None;
        for (backing, targets) in &restores {
            let outcome = retry::execute(clock, "recovery.index", self.options.max_write_time, || {
                self.restore_index(backing, targets)
            });
            match outcome {
                Ok(docs) => {
                    debug!(tx = %tx_id, index = %backing, docs, "recovery.repair.index_restored");
                    restored.push(backing.clone());
                }
                Err(err) => {
                    warn!(tx = %tx_id, index = %backing, error = %err, "recovery.repair.index_failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(restored),
        }
    }

    /// Rebuilds the documents of `targets` in one index transaction.
    fn restore_index(&self, backing: &str, targets: &BTreeSet<IndexRestore>) -> Result<usize> {
        let provider = self.graph.index_provider(backing)?;
        let tx = self.graph.begin()?;
        let built = (|| -> Result<RestoreDocs> {
            let mut docs = RestoreDocs::new();
            for target in targets {
                let index = tx.mixed_index(target.index_id)?;
                match tx.retrieve(target.element_id, target.category)? {
                    Some(element) => provider.reindex_element(&element, &index, &mut docs),
                    None => provider.remove_element(target.element_id, &index, &mut docs),
                }
            }
            Ok(docs)
        })();
        tx.rollback();
        let docs = built?;
        let count = docs.values().map(BTreeMap::len).sum();

        let mut index_tx = provider.begin_transaction()?;
        if let Err(err) = index_tx.restore(docs) {
            index_tx.rollback();
            return Err(err);
        }
        index_tx.commit()?;
        Ok(count)
    }

    fn redeliver(&self, tx_id: &TransactionId, commit: &LogEntry, log_id: &str) -> Result<()> {
        let header = TransactionLogHeader::new(
            self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1,
            self.clock.now(),
        )?;
        let content = header.serialize_user_log(commit, tx_id)?;
        let budget = self.options.max_write_time;
        retry::execute(self.clock.as_ref(), "recovery.user_log", budget, || {
            let log = self.logs.open_log(log_id)?;
            log.add(content.clone()).map(|_| ())
        })?;
        self.notice(tx_id, "recovery.repair.user_log_redelivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use crate::log::{LogTxMetadata, LogTxStatus, MemoryLogManager, SecondaryFailures};
    use crate::primitives::clock::ManualClock;
    use crate::types::{Timestamp, UmbralError};
    use bytes::Bytes;

    struct Fixture {
        clock: Arc<ManualClock>,
        graph: MemoryGraph,
        logs: Arc<MemoryLogManager>,
        pipeline: RepairPipeline,
        name: u64,
    }

    fn fixture() -> Fixture {
        let manual = Arc::new(ManualClock::new(Timestamp::from_millis(50)));
        let clock: Arc<dyn TimeSource> = manual.clone();
        let graph = MemoryGraph::new();
        let name = graph.property_key("name");
        graph
            .mixed_index("byName", "search", ElementCategory::Vertex, &[name])
            .unwrap();
        let logs = Arc::new(MemoryLogManager::new("node-a", Arc::clone(&clock)));
        let pipeline = RepairPipeline::new(
            Arc::new(graph.clone()),
            logs.clone(),
            clock,
            RecoveryOptions::default(),
        );
        Fixture {
            clock: manual,
            graph,
            logs,
            pipeline,
            name,
        }
    }

    fn precommit(
        mods: &[crate::log::Modification],
        log_id: Option<&str>,
    ) -> (TransactionId, LogEntry) {
        let header = TransactionLogHeader::new(1, Timestamp::from_millis(10)).unwrap();
        let meta = LogTxMetadata {
            log_id: log_id.map(str::to_string),
            ..LogTxMetadata::default()
        };
        let buf = header
            .serialize_modifications(LogTxStatus::Precommit, &meta, mods)
            .unwrap();
        (header.transaction_id("node-a"), TransactionLogHeader::parse(buf).unwrap())
    }

    fn snapshot(entry: LogEntry, failures: Option<SecondaryFailures>) -> TxSnapshot {
        TxSnapshot {
            status: Some(if failures.is_some() {
                LogTxStatus::SecondaryFailure
            } else {
                LogTxStatus::PrimarySuccess
            }),
            entry: Some(entry),
            failures,
        }
    }

    #[test]
    fn reindexes_vertex_and_is_idempotent() {
        let f = fixture();
        let (v, created) = f.graph.add_vertex();
        let (_, prop) = f.graph.add_property(v, f.name, &b"ada"[..]).unwrap();
        let (id, entry) = precommit(&[created, prop], None);
        let state = snapshot(entry, None);

        let report = f.pipeline.repair(&id, &state).unwrap();
        assert_eq!(report.restored_indexes, vec!["search".to_string()]);
        let search = f.graph.backend("search").unwrap();
        assert_eq!(search.len("byName"), 1);
        let doc = search.document("byName", &format!("v{v}")).unwrap();
        assert_eq!(doc[0].value, Bytes::from_static(b"ada"));

        f.pipeline.repair(&id, &state).unwrap();
        assert_eq!(search.len("byName"), 1);
        assert_eq!(search.document("byName", &format!("v{v}")).unwrap(), doc);
    }

    #[test]
    fn deleted_element_is_removed_from_index() {
        let f = fixture();
        let (v, _) = f.graph.add_vertex();
        let (_, prop) = f.graph.add_property(v, f.name, &b"ada"[..]).unwrap();
        let (id, entry) = precommit(&[prop], None);
        f.pipeline.repair(&id, &snapshot(entry.clone(), None)).unwrap();
        assert_eq!(f.graph.backend("search").unwrap().len("byName"), 1);

        f.graph.remove_vertex(v).unwrap();
        f.pipeline.repair(&id, &snapshot(entry, None)).unwrap();
        assert!(f.graph.backend("search").unwrap().is_empty("byName"));
    }

    #[test]
    fn failure_detail_narrows_scope() {
        let f = fixture();
        let (v, _) = f.graph.add_vertex();
        let (_, prop) = f.graph.add_property(v, f.name, &b"ada"[..]).unwrap();
        let (id, entry) = precommit(&[prop], Some("audit"));
        let failures = SecondaryFailures {
            user_log_failure: true,
            failed_indexes: ["other".to_string()].into(),
        };
        let report = f.pipeline.repair(&id, &snapshot(entry, Some(failures))).unwrap();
        assert!(report.restored_indexes.is_empty());
        assert!(f.graph.backend("search").unwrap().is_empty("byName"));
        assert_eq!(report.redelivered_to.as_deref(), Some("audit"));
    }

    #[test]
    fn user_log_copy_is_stamped_with_source() {
        let f = fixture();
        let (v, created) = f.graph.add_vertex();
        let (id, entry) = precommit(&[created], Some("audit"));
        let failures = SecondaryFailures {
            user_log_failure: true,
            failed_indexes: BTreeSet::new(),
        };
        f.pipeline.repair(&id, &snapshot(entry, Some(failures))).unwrap();
        let messages = f.logs.memory_log("audit").messages();
        assert_eq!(messages.len(), 1);
        let copy = TransactionLogHeader::parse(messages[0].content.clone()).unwrap();
        assert_eq!(copy.status, LogTxStatus::UserLog);
        assert_eq!(copy.metadata.source_transaction, Some(id));
        assert_eq!(copy.modifications().unwrap()[0].out_vertex_id, v);
    }

    #[test]
    fn missing_commit_record_is_skipped() {
        let f = fixture();
        let id = TransactionId::new("node-a", 9, Timestamp::from_millis(1));
        let state = TxSnapshot {
            status: Some(LogTxStatus::PrimarySuccess),
            ..TxSnapshot::default()
        };
        assert!(f.pipeline.repair(&id, &state).unwrap().skipped);
    }

    #[test]
    fn temporary_index_failure_is_retried() {
        let f = fixture();
        let (v, _) = f.graph.add_vertex();
        let (_, prop) = f.graph.add_property(v, f.name, &b"ada"[..]).unwrap();
        let (id, entry) = precommit(&[prop], None);
        let search = f.graph.backend("search").unwrap();
        search.fail_commits(1);
        f.pipeline.repair(&id, &snapshot(entry, None)).unwrap();
        assert_eq!(search.len("byName"), 1);
        assert_eq!(search.commits(), 1);
    }

    #[test]
    fn index_write_budget_runs_on_injected_clock() {
        let f = fixture();
        let (v, _) = f.graph.add_vertex();
        let (_, prop) = f.graph.add_property(v, f.name, &b"ada"[..]).unwrap();
        let (id, entry) = precommit(&[prop], None);
        let search = f.graph.backend("search").unwrap();
        search.fail_commits(10_000);
        let start = f.clock.now();
        let err = f.pipeline.repair(&id, &snapshot(entry, None)).unwrap_err();
        assert!(matches!(err, UmbralError::Timeout(_)));
        let budget = RecoveryOptions::default().max_write_time;
        assert!(f.clock.now().duration_since(start) >= budget);
        assert_eq!(search.len("byName"), 0);
    }
}
