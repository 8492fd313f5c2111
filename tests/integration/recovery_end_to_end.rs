use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use umbral::changelog::{ChangeState, LogProcessorFramework};
use umbral::graph::{ElementCategory, GraphTx, MemoryGraph};
use umbral::log::{
    Change, Log, LogTxMetadata, LogTxStatus, MemoryLog, MemoryLogManager, Modification,
    SecondaryFailures, TransactionLogHeader,
};
use umbral::metrics::CounterMetrics;
use umbral::primitives::clock::{ManualClock, TimeSource};
use umbral::recovery::{RepairPipeline, TransactionLogProcessor, TxEntry};
use umbral::{RecoveryOptions, Result, Timestamp, TransactionId};

struct Node {
    clock: Arc<ManualClock>,
    graph: MemoryGraph,
    logs: Arc<MemoryLogManager>,
    system: Arc<MemoryLog>,
    metrics: Arc<CounterMetrics>,
    name_key: u64,
}

impl Node {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(60_000)));
        let graph = MemoryGraph::new();
        let name_key = graph.property_key("name");
        graph
            .mixed_index("vertexByName", "idx1", ElementCategory::Vertex, &[name_key])
            .unwrap();
        graph
            .mixed_index("vertexByNameSecondary", "idx2", ElementCategory::Vertex, &[name_key])
            .unwrap();
        let logs = Arc::new(MemoryLogManager::new("node-1", clock.clone()));
        let system = logs.memory_log("txlog");
        Self {
            clock,
            graph,
            logs,
            system,
            metrics: Arc::new(CounterMetrics::default()),
            name_key,
        }
    }

    fn options() -> RecoveryOptions {
        RecoveryOptions::default()
            .max_commit_time(Duration::from_secs(10))
            .cleanup_interval(Duration::from_secs(3600))
    }

    fn processor(&self) -> TransactionLogProcessor {
        TransactionLogProcessor::builder(Arc::new(self.graph.clone()), self.logs.clone())
            .clock(self.clock.clone())
            .metrics(self.metrics.clone())
            .options(Self::options())
            .start(Timestamp::EPOCH)
            .unwrap()
    }

    /// Creates a named vertex; returns it with its modifications.
    fn named_vertex(&self, name: &'static [u8]) -> (u64, Vec<Modification>) {
        let (v, created) = self.graph.add_vertex();
        let (_, prop) = self.graph.add_property(v, self.name_key, name).unwrap();
        (v, vec![created, prop])
    }

    fn precommit(
        &self,
        tx: u64,
        mods: &[Modification],
        log_id: Option<&str>,
    ) -> TransactionLogHeader {
        let header = TransactionLogHeader::new(tx, self.clock.now()).unwrap();
        let meta = LogTxMetadata {
            log_id: log_id.map(str::to_string),
            ..LogTxMetadata::default()
        };
        self.system
            .add(
                header
                    .serialize_modifications(LogTxStatus::Precommit, &meta, mods)
                    .unwrap(),
            )
            .unwrap();
        header
    }

    fn expire_all(&self, processor: &TransactionLogProcessor) {
        self.clock.advance(Duration::from_secs(11));
        processor.force_sweep();
    }
}

#[test]
fn primary_success_without_confirmation_reindexes_once() {
    let node = Node::new();
    let processor = node.processor();
    let (v, mods) = node.named_vertex(b"ada");

    let header = node.precommit(1, &mods, None);
    node.system
        .add(header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap())
        .unwrap();
    node.expire_all(&processor);
    processor.shutdown();

    let idx1 = node.graph.backend("idx1").unwrap();
    assert_eq!(idx1.len("vertexByName"), 1);
    assert_eq!(idx1.commits(), 1);
    let doc = idx1.document("vertexByName", &format!("v{v}")).unwrap();
    assert_eq!(&doc[0].value[..], b"ada");
    assert_eq!(processor.statistics().failure, 1);
    assert_eq!(CounterMetrics::get(&node.metrics.repairs_completed), 1);

    // Replaying the same transaction leaves the index as it was.
    let pipeline = RepairPipeline::new(
        Arc::new(node.graph.clone()),
        node.logs.clone(),
        node.clock.clone(),
        Node::options(),
    );
    let entry = TxEntry::new();
    entry
        .update(TransactionLogHeader::parse(node.system.messages()[0].content.clone()).unwrap())
        .unwrap();
    entry
        .update(TransactionLogHeader::parse(node.system.messages()[1].content.clone()).unwrap())
        .unwrap();
    pipeline
        .repair(&header.transaction_id("node-1"), &entry.snapshot())
        .unwrap();
    assert_eq!(idx1.len("vertexByName"), 1);
    assert_eq!(idx1.document("vertexByName", &format!("v{v}")).unwrap(), doc);
}

#[test]
fn confirmed_transaction_is_left_alone() {
    let node = Node::new();
    let processor = node.processor();
    let (_, mods) = node.named_vertex(b"ada");

    let header = node.precommit(1, &mods, None);
    node.system
        .add(header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap())
        .unwrap();
    node.system.add(header.serialize_secondary(None)).unwrap();
    node.expire_all(&processor);
    processor.shutdown();

    assert_eq!(processor.statistics().success, 1);
    assert!(node.graph.backend("idx1").unwrap().is_empty("vertexByName"));
}

#[test]
fn recorded_failures_limit_the_repair() {
    let node = Node::new();
    let processor = node.processor();
    let (v, mods) = node.named_vertex(b"ada");

    let header = node.precommit(1, &mods, Some("audit"));
    node.system
        .add(header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap())
        .unwrap();
    let failures = SecondaryFailures {
        user_log_failure: false,
        failed_indexes: BTreeSet::from(["idx2".to_string()]),
    };
    node.system
        .add(header.serialize_secondary(Some(&failures)))
        .unwrap();
    node.expire_all(&processor);
    processor.shutdown();

    assert!(node.graph.backend("idx1").unwrap().is_empty("vertexByName"));
    let idx2 = node.graph.backend("idx2").unwrap();
    assert!(idx2
        .document("vertexByNameSecondary", &format!("v{v}"))
        .is_some());
    assert!(node.logs.memory_log("audit").messages().is_empty());
}

#[test]
fn undelivered_user_log_copy_reaches_change_processors() {
    let node = Node::new();
    let seen: Arc<Mutex<Vec<(TransactionId, BTreeSet<u64>)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let framework = LogProcessorFramework::new(node.logs.clone(), Arc::new(node.graph.clone()))
        .with_clock(node.clock.clone());
    framework
        .add_log_processor("audit")
        .unwrap()
        .set_start_time(Timestamp::EPOCH)
        .add_processor(
            move |_: &dyn GraphTx, id: &TransactionId, changes: &ChangeState| -> Result<()> {
                sink.lock().push((id.clone(), changes.vertices(Change::Added)));
                Ok(())
            },
        )
        .build()
        .unwrap();

    let processor = node.processor();
    let (v, mods) = node.named_vertex(b"ada");
    let header = node.precommit(5, &mods, Some("audit"));
    node.system
        .add(header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap())
        .unwrap();
    let failures = SecondaryFailures {
        user_log_failure: true,
        failed_indexes: BTreeSet::new(),
    };
    node.system
        .add(header.serialize_secondary(Some(&failures)))
        .unwrap();
    node.expire_all(&processor);
    processor.shutdown();
    framework.shutdown().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, header.transaction_id("node-1"));
    assert_eq!(seen[0].1, BTreeSet::from([v]));
    // Index failures were not recorded, so no index was touched.
    assert!(node.graph.backend("idx1").unwrap().is_empty("vertexByName"));
}

#[test]
fn missing_precommit_is_skipped() {
    let node = Node::new();
    let processor = node.processor();
    let header = TransactionLogHeader::new(3, node.clock.now()).unwrap();
    node.system
        .add(header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap())
        .unwrap();
    node.expire_all(&processor);
    processor.shutdown();

    assert_eq!(processor.statistics().failure, 1);
    assert_eq!(CounterMetrics::get(&node.metrics.repairs_completed), 1);
    assert_eq!(node.graph.backend("idx1").unwrap().commits(), 0);
}
