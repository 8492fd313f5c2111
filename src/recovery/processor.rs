use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::TxCache;
use super::entry::TxSnapshot;
use super::repair::RepairPipeline;
use crate::config::RecoveryOptions;
use crate::graph::GraphProvider;
use crate::log::{
    Log, LogManager, Message, MessageReader, ReadMarker, ReaderId, TransactionLogHeader,
};
use crate::metrics::{default_metrics, ConsistencyMetrics};
use crate::primitives::clock::{SystemClock, TimeSource};
use crate::primitives::concurrency::BackgroundWorker;
use crate::types::{Result, Timestamp, TransactionId};

const CLEANER_STOP_WAIT: Duration = Duration::from_secs(5);

/// Transactions seen to expire, split by outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Transactions that confirmed their secondary effects in time.
    pub success: u64,
    /// Transactions handed to repair.
    pub failure: u64,
}

#[derive(Default)]
struct Counters {
    success: AtomicU64,
    failure: AtomicU64,
}

struct RepairTask {
    tx_id: TransactionId,
    state: TxSnapshot,
}

type RepairQueue = Arc<Mutex<Option<Sender<RepairTask>>>>;

/// Folds system log records into the transaction cache.
struct TxLogReader {
    cache: Arc<TxCache>,
}

impl MessageReader for TxLogReader {
    fn read(&self, message: &Message) {
        let entry = match TransactionLogHeader::parse(message.content.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                error!(sender = %message.sender_id, error = %err, "recovery.reader.unparseable");
                return;
            }
        };
        let tx_id = entry.header.transaction_id(&message.sender_id);
        let status = entry.status;
        if let Err(err) = self.cache.get_or_create(&tx_id).update(entry) {
            error!(tx = %tx_id, ?status, error = %err, "recovery.reader.rejected");
        }
    }
}

/// Configures and starts a [`TransactionLogProcessor`].
pub struct TransactionLogProcessorBuilder {
    graph: Arc<dyn GraphProvider>,
    logs: Arc<dyn LogManager>,
    clock: Arc<dyn TimeSource>,
    metrics: Arc<dyn ConsistencyMetrics>,
    options: RecoveryOptions,
}

impl TransactionLogProcessorBuilder {
    /// Replaces the wall clock.
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn ConsistencyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets recovery options.
    pub fn options(mut self, options: RecoveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts tailing the system log from `start_time`.
    pub fn start(self, start_time: Timestamp) -> Result<TransactionLogProcessor> {
        self.options.validate()?;
        let Self {
            graph,
            logs,
            clock,
            metrics,
            options,
        } = self;

        let counters = Arc::new(Counters::default());
        let queue: RepairQueue = Arc::new(Mutex::new(None));
        let (sender, receiver) = mpsc::channel();
        *queue.lock() = Some(sender);

        let cache = Arc::new(TxCache::new(
            options.tx_lifetime(),
            Arc::clone(&clock),
            eviction_listener(
                Arc::clone(&counters),
                Arc::clone(&queue),
                Arc::clone(&metrics),
                options.verbose,
            ),
        ));

        let pipeline = Arc::new(RepairPipeline::new(
            graph,
            Arc::clone(&logs),
            clock,
            options.clone(),
        ));
        let workers = spawn_repair_workers(
            options.repair_workers,
            receiver,
            pipeline,
            Arc::clone(&metrics),
        )?;

        let sweep_cache = Arc::clone(&cache);
        let cleaner =
            BackgroundWorker::spawn("umbral-tx-cleaner", options.cleanup_interval, move || {
                let evicted = sweep_cache.clean_up();
                if evicted > 0 {
                    debug!(evicted, "recovery.cleaner.swept");
                }
            })?;

        let log = logs.open_log(&options.system_log)?;
        let reader = log.register_reader(
            ReadMarker::FromTime(start_time),
            Arc::new(TxLogReader {
                cache: Arc::clone(&cache),
            }),
        )?;
        info!(log = %options.system_log, start = %start_time, "recovery.processor.started");

        Ok(TransactionLogProcessor {
            cache,
            counters,
            log,
            reader: Mutex::new(Some(reader)),
            cleaner: Mutex::new(Some(cleaner)),
            queue,
            workers: Mutex::new(workers),
        })
    }
}

fn eviction_listener(
    counters: Arc<Counters>,
    queue: RepairQueue,
    metrics: Arc<dyn ConsistencyMetrics>,
    verbose: bool,
) -> super::cache::EvictionListener {
    Box::new(move |tx_id, state| {
        if !state.needs_repair() {
            counters.success.fetch_add(1, Ordering::Relaxed);
            metrics.tx_confirmed();
            return;
        }
        counters.failure.fetch_add(1, Ordering::Relaxed);
        metrics.tx_failed();
        if verbose {
            info!(tx = %tx_id, status = ?state.status, "recovery.tx.unconfirmed");
        } else {
            debug!(tx = %tx_id, status = ?state.status, "recovery.tx.unconfirmed");
        }
        match queue.lock().as_ref() {
            Some(sender) => {
                if sender.send(RepairTask { tx_id, state }).is_err() {
                    warn!("recovery.repair.queue_closed");
                }
            }
            None => warn!(tx = %tx_id, "recovery.repair.after_shutdown"),
        }
    })
}

fn spawn_repair_workers(
    count: usize,
    receiver: Receiver<RepairTask>,
    pipeline: Arc<RepairPipeline>,
    metrics: Arc<dyn ConsistencyMetrics>,
) -> Result<Vec<JoinHandle<()>>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..count.max(1))
        .map(|i| {
            let receiver = Arc::clone(&receiver);
            let pipeline = Arc::clone(&pipeline);
            let metrics = Arc::clone(&metrics);
            thread::Builder::new()
                .name(format!("umbral-repair-{i}"))
                .spawn(move || loop {
                    let task = receiver.lock().recv();
                    let Ok(task) = task else {
                        break;
                    };
                    match pipeline.repair(&task.tx_id, &task.state) {
                        Ok(_) => metrics.repair_completed(),
                        Err(err) => {
                            error!(tx = %task.tx_id, error = %err, "recovery.repair.failed");
                            metrics.repair_failed();
                        }
                    }
                })
                .map_err(Into::into)
        })
        .collect()
}

/// Tails the system transaction log and repairs transactions whose secondary
/// effects were not confirmed within the commit-time bound.
///
/// Every record is folded into a cached per-transaction entry. When an entry
/// expires its final status decides the outcome; unconfirmed transactions are
/// queued to repair worker threads so eviction never waits on repair I/O.
pub struct TransactionLogProcessor {
    cache: Arc<TxCache>,
    counters: Arc<Counters>,
    log: Arc<dyn Log>,
    reader: Mutex<Option<ReaderId>>,
    cleaner: Mutex<Option<BackgroundWorker>>,
    queue: RepairQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionLogProcessor {
    /// Starts configuring a processor over `graph`, reading and writing logs
    /// through `logs`.
    pub fn builder(
        graph: Arc<dyn GraphProvider>,
        logs: Arc<dyn LogManager>,
    ) -> TransactionLogProcessorBuilder {
        TransactionLogProcessorBuilder {
            graph,
            logs,
            clock: Arc::new(SystemClock),
            metrics: default_metrics(),
            options: RecoveryOptions::default(),
        }
    }

    /// Success and failure counts so far.
    pub fn statistics(&self) -> RecoveryStats {
        RecoveryStats {
            success: self.counters.success.load(Ordering::Relaxed),
            failure: self.counters.failure.load(Ordering::Relaxed),
        }
    }

    /// Evicts every expired transaction now; returns how many were evicted.
    pub fn force_sweep(&self) -> usize {
        self.cache.clean_up()
    }

    /// Number of transactions currently tracked.
    pub fn pending(&self) -> usize {
        self.cache.len()
    }

    /// Stops reading, stops the cleaner, and waits for queued repairs.
    ///
    /// Calling it again has no effect.
    pub fn shutdown(&self) {
        if let Some(reader) = self.reader.lock().take() {
            self.log.unregister_reader(reader);
        }
        if let Some(mut cleaner) = self.cleaner.lock().take() {
            cleaner.stop(CLEANER_STOP_WAIT);
        }
        self.queue.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            if worker.join().is_err() {
                error!("recovery.repair.worker_panicked");
            }
        }
        info!(log = %self.log.name(), "recovery.processor.stopped");
    }
}

impl Drop for TransactionLogProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
