use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::state::ChangeState;
use crate::graph::{GraphProvider, GraphTx};
use crate::log::{
    Log, LogEntry, LogManager, Message, MessageReader, ReadMarker, ReaderId, TransactionLogHeader,
};
use crate::metrics::{default_metrics, ConsistencyMetrics};
use crate::primitives::clock::{SystemClock, TimeSource};
use crate::types::{Result, Timestamp, TransactionId, UmbralError};

const DEFAULT_RETRY_ATTEMPTS: u32 = 1;

/// User callback invoked once per committed transaction read from a user log.
pub trait ChangeProcessor: Send + Sync {
    /// Handles the changes of transaction `tx_id`.
    ///
    /// `tx` is a fresh graph transaction committed when this returns `Ok`
    /// and rolled back otherwise.
    fn process(&self, tx: &dyn GraphTx, tx_id: &TransactionId, changes: &ChangeState) -> Result<()>;
}

impl<F> ChangeProcessor for F
where
    F: Fn(&dyn GraphTx, &TransactionId, &ChangeState) -> Result<()> + Send + Sync,
{
    fn process(&self, tx: &dyn GraphTx, tx_id: &TransactionId, changes: &ChangeState) -> Result<()> {
        self(tx, tx_id, changes)
    }
}

struct Registration {
    log: Arc<dyn Log>,
    readers: Vec<ReaderId>,
}

#[derive(Default)]
struct Registry {
    logs: HashMap<String, Registration>,
    closed: bool,
}

/// Runs [`ChangeProcessor`]s over user logs.
pub struct LogProcessorFramework {
    logs: Arc<dyn LogManager>,
    graph: Arc<dyn GraphProvider>,
    clock: Arc<dyn TimeSource>,
    metrics: Arc<dyn ConsistencyMetrics>,
    registry: Mutex<Registry>,
}

impl LogProcessorFramework {
    /// Creates a framework reading logs from `logs` and opening transactions on `graph`.
    pub fn new(logs: Arc<dyn LogManager>, graph: Arc<dyn GraphProvider>) -> Self {
        Self {
            logs,
            graph,
            clock: Arc::new(SystemClock),
            metrics: default_metrics(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Replaces the clock used by [`LogProcessorBuilder::set_start_time_now`].
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn ConsistencyMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Starts registering processors on the user log `log_name`.
    pub fn add_log_processor(&self, log_name: &str) -> Result<LogProcessorBuilder<'_>> {
        let registry = self.registry.lock();
        if registry.closed {
            return Err(UmbralError::Closed("log processor framework"));
        }
        if registry.logs.contains_key(log_name) {
            return Err(UmbralError::Invalid(format!(
                "processors already registered on log {log_name}"
            )));
        }
        Ok(LogProcessorBuilder {
            framework: self,
            log_name: log_name.to_string(),
            identifier: None,
            start_time: None,
            processors: Vec::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    /// Stops every processor on `log_name`; returns whether any was registered.
    pub fn remove_log_processor(&self, log_name: &str) -> Result<bool> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(UmbralError::Closed("log processor framework"));
        }
        let Some(registration) = registry.logs.remove(log_name) else {
            return Ok(false);
        };
        for reader in registration.readers {
            registration.log.unregister_reader(reader);
        }
        info!(log = log_name, "changelog.processors_removed");
        Ok(true)
    }

    /// Stops all processors and closes their logs.
    pub fn shutdown(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Ok(());
        }
        registry.closed = true;
        let mut first_err = None;
        for (name, registration) in registry.logs.drain() {
            if let Err(err) = registration.log.close() {
                warn!(log = %name, error = %err, "changelog.close_failed");
                first_err.get_or_insert(err);
            }
        }
        debug!("changelog.shutdown");
        first_err.map_or(Ok(()), Err)
    }

    fn register(
        &self,
        log_name: String,
        marker: ReadMarker,
        processors: Vec<Arc<dyn ChangeProcessor>>,
        retry_attempts: u32,
    ) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(UmbralError::Closed("log processor framework"));
        }
        if registry.logs.contains_key(&log_name) {
            return Err(UmbralError::Invalid(format!(
                "processors already registered on log {log_name}"
            )));
        }
        let log = self.logs.open_log(&log_name)?;
        let mut readers = Vec::with_capacity(processors.len());
        for processor in processors {
            let converter = Arc::new(ChangeConverter {
                log_name: log_name.clone(),
                graph: Arc::clone(&self.graph),
                metrics: Arc::clone(&self.metrics),
                processor,
                retry_attempts,
            });
            match log.register_reader(marker.clone(), converter) {
                Ok(id) => readers.push(id),
                Err(err) => {
                    for id in readers {
                        log.unregister_reader(id);
                    }
                    return Err(err);
                }
            }
        }
        info!(log = %log_name, processors = readers.len(), ?marker, "changelog.processors_added");
        registry.logs.insert(log_name, Registration { log, readers });
        Ok(())
    }
}

/// Collects the settings of processors added to one user log.
pub struct LogProcessorBuilder<'a> {
    framework: &'a LogProcessorFramework,
    log_name: String,
    identifier: Option<String>,
    start_time: Option<Timestamp>,
    processors: Vec<Arc<dyn ChangeProcessor>>,
    retry_attempts: u32,
}

impl LogProcessorBuilder<'_> {
    /// Name under which the read position is remembered across restarts.
    pub fn set_processor_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Reads messages appended at or after `start`.
    pub fn set_start_time(mut self, start: Timestamp) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Reads messages appended from now on.
    pub fn set_start_time_now(mut self) -> Self {
        self.start_time = Some(self.framework.clock.now());
        self
    }

    /// Adds a processor; each one receives every message.
    pub fn add_processor(mut self, processor: impl ChangeProcessor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Number of attempts per message before it is dropped; must be positive.
    pub fn set_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Registers the processors and starts reading.
    pub fn build(self) -> Result<()> {
        if self.processors.is_empty() {
            return Err(UmbralError::Invalid(format!(
                "no processors for log {}",
                self.log_name
            )));
        }
        if self.retry_attempts == 0 {
            return Err(UmbralError::Invalid("retry attempts must be positive".into()));
        }
        let marker = match (self.identifier, self.start_time) {
            (Some(id), Some(ts)) => ReadMarker::FromIdentifierOrTime(id, ts),
            (Some(id), None) => ReadMarker::FromIdentifierOrNow(id),
            (None, Some(ts)) => ReadMarker::FromTime(ts),
            (None, None) => ReadMarker::FromNow,
        };
        self.framework
            .register(self.log_name, marker, self.processors, self.retry_attempts)
    }
}

/// Turns user log messages into [`ChangeState`]s for one processor.
struct ChangeConverter {
    log_name: String,
    graph: Arc<dyn GraphProvider>,
    metrics: Arc<dyn ConsistencyMetrics>,
    processor: Arc<dyn ChangeProcessor>,
    retry_attempts: u32,
}

impl ChangeConverter {
    fn attempt(&self, tx_id: &TransactionId, entry: &LogEntry) -> Result<()> {
        let modifications = entry.modifications()?;
        let tx = self.graph.begin()?;
        let outcome = ChangeState::from_modifications(tx.as_ref(), &modifications)
            .and_then(|changes| self.processor.process(tx.as_ref(), tx_id, &changes));
        match outcome {
            Ok(()) => tx.commit(),
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

impl MessageReader for ChangeConverter {
    fn read(&self, message: &Message) {
        let entry = match TransactionLogHeader::parse(message.content.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                error!(log = %self.log_name, error = %err, "changelog.unparseable");
                self.metrics.change_dropped();
                return;
            }
        };
        let tx_id = entry
            .metadata
            .source_transaction
            .clone()
            .unwrap_or_else(|| entry.header.transaction_id(&message.sender_id));

        for attempt in 1..=self.retry_attempts {
            match self.attempt(&tx_id, &entry) {
                Ok(()) => return,
                Err(err) if attempt < self.retry_attempts => {
                    debug!(
                        log = %self.log_name,
                        tx = %tx_id,
                        attempt,
                        error = %err,
                        "changelog.retry"
                    );
                }
                Err(err) => {
                    error!(
                        log = %self.log_name,
                        tx = %tx_id,
                        attempts = attempt,
                        error = %err,
                        "changelog.dropped"
                    );
                    self.metrics.change_dropped();
                }
            }
        }
    }
}
