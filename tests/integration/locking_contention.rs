use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use umbral::locking::{ConsistentKeyLocker, LockClaim, MediatorRegistry, TxHandle};
use umbral::primitives::clock::{ManualClock, TimeSource};
use umbral::storage::{Entry, InMemoryStore, KeyColumnValueStore};
use umbral::{LockerOptions, Rid, Timestamp, UmbralError};

const NUM_PROCESSES: usize = 6;

struct Cluster {
    clock: Arc<ManualClock>,
    locks: Arc<InMemoryStore>,
    data: Arc<InMemoryStore>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new(Timestamp::from_millis(5_000))),
            locks: Arc::new(InMemoryStore::new("graph_lock_")),
            data: Arc::new(InMemoryStore::new("graph")),
        }
    }

    /// A locker with its own mediator registry, standing in for a separate process.
    fn process(&self, rid: &str, options: LockerOptions) -> ConsistentKeyLocker {
        let registry =
            MediatorRegistry::<TxHandle>::new(self.clock.clone() as Arc<dyn TimeSource>);
        ConsistentKeyLocker::new(
            self.locks.clone() as Arc<dyn KeyColumnValueStore>,
            self.data.clone() as Arc<dyn KeyColumnValueStore>,
            &registry,
            options,
        )
        .unwrap()
        .with_rid(Rid::new(rid.to_string()))
    }
}

fn name_claim(expected: Option<&'static [u8]>) -> LockClaim {
    LockClaim::new(&b"vertex-7"[..], &b"name"[..], expected.map(Bytes::from_static))
}

#[test]
fn exactly_one_concurrent_writer_wins() {
    let cluster = Arc::new(Cluster::new());
    let written = Arc::new(Barrier::new(NUM_PROCESSES));
    let checked_all = Arc::new(Barrier::new(NUM_PROCESSES));
    let mut handles = Vec::new();

    for i in 0..NUM_PROCESSES {
        let cluster = Arc::clone(&cluster);
        let written = Arc::clone(&written);
        let checked_all = Arc::clone(&checked_all);
        handles.push(thread::spawn(move || {
            let locker = cluster.process(&format!("process-{i}"), LockerOptions::default());
            let mut tx = locker.transaction();
            let wrote = locker.write_lock(name_claim(None), &mut tx);
            written.wait();
            let checked = wrote.and_then(|()| locker.check_locks(&mut tx));
            // Claims stay visible until every process has verified.
            checked_all.wait();
            locker.delete_locks(&mut tx);
            checked
        }));
    }

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1, "outcomes: {outcomes:?}");
    for outcome in outcomes.into_iter().filter_map(|o| o.err()) {
        assert!(
            matches!(outcome, UmbralError::PermanentLocking(_)),
            "unexpected failure {outcome:?}"
        );
    }
    assert_eq!(cluster.locks.column_count(name_claim(None).lock_key()), 0);
}

#[test]
fn threads_of_one_process_are_mediated_locally() {
    let cluster = Arc::new(Cluster::new());
    let locker = Arc::new(cluster.process("shared", LockerOptions::default()));
    let start = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let locker = Arc::clone(&locker);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                let mut tx = locker.transaction();
                start.wait();
                locker.write_lock(name_claim(None), &mut tx).is_ok()
            })
        })
        .collect();

    let acquired = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(acquired, 1);
    // Only the local winner ever touched the store.
    assert_eq!(cluster.locks.column_count(name_claim(None).lock_key()), 1);
}

#[test]
fn expired_claim_does_not_block_a_new_writer() {
    let cluster = Cluster::new();
    let options = LockerOptions::default()
        .lock_wait(Duration::from_millis(100))
        .lock_expire(Duration::from_secs(30));

    let crashed = cluster.process("crashed", options.clone());
    let mut stale = crashed.transaction();
    crashed.write_lock(name_claim(None), &mut stale).unwrap();
    // The writer dies without deleting its claim.
    drop(stale);

    cluster.clock.advance(Duration::from_secs(31));
    let survivor = cluster.process("survivor", options);
    let mut tx = survivor.transaction();
    survivor.write_lock(name_claim(None), &mut tx).unwrap();
    survivor.check_locks(&mut tx).unwrap();
}

#[test]
fn expected_value_mismatch_fails_permanently() {
    let cluster = Cluster::new();
    cluster
        .data
        .mutate(b"vertex-7", &[Entry::new(&b"name"[..], &b"grace"[..])], &[])
        .unwrap();

    let locker = cluster.process("a", LockerOptions::default());
    let mut tx = locker.transaction();
    locker.write_lock(name_claim(Some(&b"ada"[..])), &mut tx).unwrap();
    let err = locker.check_locks(&mut tx).unwrap_err();
    assert!(matches!(err, UmbralError::PermanentLocking(_)));

    let mut retry = locker.transaction();
    locker.delete_locks(&mut tx);
    locker
        .write_lock(name_claim(Some(&b"grace"[..])), &mut retry)
        .unwrap();
    locker.check_locks(&mut retry).unwrap();
}
