use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use umbral::changelog::{ChangeState, LogProcessorFramework};
use umbral::graph::{GraphTx, MemoryGraph};
use umbral::log::{
    Change, Log, LogTxMetadata, LogTxStatus, MemoryLogManager, Modification, TransactionLogHeader,
};
use umbral::metrics::CounterMetrics;
use umbral::primitives::clock::{ManualClock, TimeSource};
use umbral::{Result, Timestamp, TransactionId, UmbralError};

fn user_log_record(clock: &ManualClock, tx: u64, mods: &[Modification]) -> Bytes {
    TransactionLogHeader::new(tx, clock.now())
        .unwrap()
        .serialize_modifications(LogTxStatus::UserLog, &LogTxMetadata::default(), mods)
        .unwrap()
}

#[derive(Default)]
struct Summary {
    added_vertices: usize,
    removed_vertices: usize,
    added_edges: usize,
    removed_properties: usize,
}

#[test]
fn graph_history_replays_as_logical_events() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10)));
    let graph = MemoryGraph::new();
    let logs = Arc::new(MemoryLogManager::new("node-1", clock.clone()));
    let framework =
        LogProcessorFramework::new(logs.clone(), Arc::new(graph.clone())).with_clock(clock.clone());

    let summary = Arc::new(Mutex::new(Summary::default()));
    let sink = Arc::clone(&summary);
    let knows = graph.edge_label("knows");
    let name = graph.property_key("name");
    framework
        .add_log_processor("feed")
        .unwrap()
        .set_start_time_now()
        .add_processor(
            move |_: &dyn GraphTx, _: &TransactionId, changes: &ChangeState| -> Result<()> {
                let mut s = sink.lock();
                s.added_vertices += changes.vertices(Change::Added).len();
                s.removed_vertices += changes.vertices(Change::Removed).len();
                s.added_edges += changes.relations(Change::Added, &[knows]).len();
                s.removed_properties += changes.relations(Change::Removed, &[name]).len();
                Ok(())
            },
        )
        .build()
        .unwrap();

    let feed = logs.memory_log("feed");
    let (a, ma) = graph.add_vertex();
    let (b, mb) = graph.add_vertex();
    let (_, pa) = graph.add_property(a, name, &b"ada"[..]).unwrap();
    let (_, e) = graph.add_edge(knows, a, b, BTreeMap::new()).unwrap();
    feed.add(user_log_record(&clock, 1, &[ma, mb, pa, e])).unwrap();

    clock.advance(std::time::Duration::from_millis(5));
    let removed = graph.remove_vertex(a).unwrap();
    feed.add(user_log_record(&clock, 2, &removed)).unwrap();

    let s = summary.lock();
    assert_eq!(s.added_vertices, 2);
    assert_eq!(s.removed_vertices, 1);
    assert_eq!(s.added_edges, 1);
    assert_eq!(s.removed_properties, 1);
}

#[test]
fn processors_resume_from_their_identifier() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10)));
    let graph = MemoryGraph::new();
    let logs = Arc::new(MemoryLogManager::new("node-1", clock.clone()));
    let feed = logs.memory_log("feed");
    let calls = Arc::new(AtomicU32::new(0));

    let register = |framework: &LogProcessorFramework| {
        let counter = Arc::clone(&calls);
        framework
            .add_log_processor("feed")
            .unwrap()
            .set_processor_identifier("indexer")
            .set_start_time(Timestamp::EPOCH)
            .add_processor(
                move |_: &dyn GraphTx, _: &TransactionId, _: &ChangeState| -> Result<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .build()
            .unwrap();
    };

    let first = LogProcessorFramework::new(logs.clone(), Arc::new(graph.clone()));
    register(&first);
    let (_, m) = graph.add_vertex();
    feed.add(user_log_record(&clock, 1, &[m.clone()])).unwrap();
    assert!(first.remove_log_processor("feed").unwrap());

    feed.add(user_log_record(&clock, 2, &[m])).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A restarted processor picks up only what it has not seen.
    let second = LogProcessorFramework::new(logs.clone(), Arc::new(graph.clone()));
    register(&second);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn flaky_processor_succeeds_within_its_attempts() {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10)));
    let graph = MemoryGraph::new();
    let logs = Arc::new(MemoryLogManager::new("node-1", clock.clone()));
    let metrics = Arc::new(CounterMetrics::default());
    let framework = LogProcessorFramework::new(logs.clone(), Arc::new(graph.clone()))
        .with_metrics(metrics.clone());

    let failures_left = Arc::new(AtomicU32::new(2));
    let delivered = Arc::new(AtomicU32::new(0));
    let (left, done) = (Arc::clone(&failures_left), Arc::clone(&delivered));
    framework
        .add_log_processor("feed")
        .unwrap()
        .set_retry_attempts(3)
        .add_processor(
            move |_: &dyn GraphTx, _: &TransactionId, _: &ChangeState| -> Result<()> {
                if left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(UmbralError::TemporaryBackend("index busy".into()));
                }
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .build()
        .unwrap();

    let (_, m) = graph.add_vertex();
    logs.memory_log("feed")
        .add(user_log_record(&clock, 1, &[m]))
        .unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(CounterMetrics::get(&metrics.changes_dropped), 0);
}
