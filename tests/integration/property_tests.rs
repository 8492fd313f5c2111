use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use umbral::graph::MemoryGraph;
use umbral::locking::{ConsistentKeyLocker, LockClaim, MediatorRegistry, TxHandle};
use umbral::log::{
    Log, LogTxMetadata, LogTxStatus, MemoryLogManager, SecondaryFailures, TransactionLogHeader,
};
use umbral::primitives::clock::{ManualClock, TimeSource};
use umbral::recovery::TransactionLogProcessor;
use umbral::storage::{InMemoryStore, KeyColumnValueStore};
use umbral::{LockerOptions, RecoveryOptions, Rid, Timestamp};

fn claim() -> LockClaim {
    LockClaim::new(&b"k"[..], &b"c"[..], None)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Claims written within the settle window: the earliest one, ties broken
    /// by rid, is the only one to verify.
    #[test]
    fn earliest_claim_wins(gaps in proptest::collection::vec(0u64..40, 2..7)) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let locks = Arc::new(InMemoryStore::new("locks"));
        let data = Arc::new(InMemoryStore::new("data"));

        let mut lockers = Vec::new();
        for (i, gap) in gaps.iter().enumerate() {
            let registry = MediatorRegistry::<TxHandle>::new(clock.clone() as Arc<dyn TimeSource>);
            let locker = ConsistentKeyLocker::new(
                locks.clone() as Arc<dyn KeyColumnValueStore>,
                data.clone() as Arc<dyn KeyColumnValueStore>,
                &registry,
                LockerOptions::default().lock_wait(Duration::from_millis(500)),
            )
            .unwrap()
            .with_rid(Rid::new(format!("r{i}")));
            clock.advance(Duration::from_millis(*gap));
            let mut tx = locker.transaction();
            locker.write_lock(claim(), &mut tx).unwrap();
            lockers.push((locker, tx));
        }

        let outcomes: Vec<bool> = lockers
            .iter_mut()
            .map(|(locker, tx)| locker.check_locks(tx).is_ok())
            .collect();
        prop_assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        // Writers are ordered by time and then by rid, so the first always wins.
        prop_assert!(outcomes[0]);
    }
}

#[derive(Clone, Copy, Debug)]
enum Record {
    Primary,
    Complete,
    SecondarySuccess,
    SecondaryFailure,
}

fn records() -> impl Strategy<Value = Vec<Record>> {
    (
        prop_oneof![Just(None), Just(Some(Record::Primary)), Just(Some(Record::Complete))],
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(primary, success, failure)| {
            let mut out: Vec<Record> = primary.into_iter().collect();
            if success {
                out.push(Record::SecondarySuccess);
            }
            if failure {
                out.push(Record::SecondaryFailure);
            }
            out
        })
        .prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A transaction is repaired exactly when its secondary effects were
    /// reported failed, or its primary commit was never followed by any
    /// secondary outcome.
    #[test]
    fn expiry_classification(seq in records(), precommit_first in any::<bool>()) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let graph = MemoryGraph::new();
        let logs = Arc::new(MemoryLogManager::new("node", clock.clone()));
        let system = logs.memory_log("txlog");
        let processor = TransactionLogProcessor::builder(Arc::new(graph.clone()), logs)
            .clock(clock.clone())
            .options(RecoveryOptions::default().cleanup_interval(Duration::from_secs(3600)))
            .start(Timestamp::EPOCH)
            .unwrap();

        let header = TransactionLogHeader::new(1, clock.now()).unwrap();
        let (_, marker) = graph.add_vertex();
        let precommit = header
            .serialize_modifications(LogTxStatus::Precommit, &LogTxMetadata::default(), &[marker])
            .unwrap();
        let mut wire: Vec<Bytes> = seq
            .iter()
            .map(|r| match r {
                Record::Primary => header.serialize_primary(LogTxStatus::PrimarySuccess).unwrap(),
                Record::Complete => header.serialize_primary(LogTxStatus::CompleteSuccess).unwrap(),
                Record::SecondarySuccess => header.serialize_secondary(None),
                Record::SecondaryFailure => header.serialize_secondary(Some(&SecondaryFailures {
                    user_log_failure: false,
                    failed_indexes: ["none".to_string()].into(),
                })),
            })
            .collect();
        if precommit_first {
            wire.insert(0, precommit);
        } else {
            wire.push(precommit);
        }
        for record in wire {
            system.add(record).unwrap();
        }

        clock.advance(Duration::from_secs(60));
        processor.force_sweep();
        processor.shutdown();

        let failed = seq.iter().any(|r| matches!(r, Record::SecondaryFailure))
            || (seq.iter().any(|r| matches!(r, Record::Primary))
                && !seq.iter().any(|r| matches!(r, Record::SecondarySuccess)));
        let stats = processor.statistics();
        prop_assert_eq!(stats.failure, u64::from(failed));
        prop_assert_eq!(stats.success, u64::from(!failed));
    }
}
