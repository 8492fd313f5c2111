use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::transport::{Log, LogManager, Message, MessageReader, ReadMarker, ReaderId};
use crate::primitives::clock::TimeSource;
use crate::types::{Result, UmbralError};

struct Registration {
    id: ReaderId,
    identifier: Option<String>,
    reader: Arc<dyn MessageReader>,
}

#[derive(Default)]
struct LogState {
    messages: Vec<Message>,
    readers: Vec<Registration>,
    /// Next message position per read identifier.
    positions: HashMap<String, usize>,
    closed: bool,
}

/// In-process log delivering messages synchronously on the appending thread.
pub struct MemoryLog {
    name: String,
    sender_id: String,
    clock: Arc<dyn TimeSource>,
    state: Mutex<LogState>,
    next_reader: AtomicU64,
}

impl MemoryLog {
    /// Creates an empty log.
    pub fn new(
        name: impl Into<String>,
        sender_id: impl Into<String>,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            name: name.into(),
            sender_id: sender_id.into(),
            clock,
            state: Mutex::new(LogState::default()),
            next_reader: AtomicU64::new(1),
        }
    }

    /// Every message appended so far.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().messages.clone()
    }

    /// Appends a message carrying another instance's sender id.
    pub fn add_from(&self, sender_id: &str, content: Bytes) -> Result<Message> {
        let message = Message {
            sender_id: sender_id.to_string(),
            content,
            timestamp: self.clock.now(),
        };
        let (position, readers) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UmbralError::Closed("log"));
            }
            state.messages.push(message.clone());
            let position = state.messages.len() - 1;
            let readers: Vec<_> = state
                .readers
                .iter()
                .map(|r| (r.identifier.clone(), Arc::clone(&r.reader)))
                .collect();
            (position, readers)
        };
        trace!(log = %self.name, position, readers = readers.len(), "log.add");
        for (identifier, reader) in readers {
            reader.read(&message);
            if let Some(identifier) = identifier {
                self.advance(identifier, position + 1);
            }
        }
        Ok(message)
    }

    fn advance(&self, identifier: String, next: usize) {
        let mut state = self.state.lock();
        let slot = state.positions.entry(identifier).or_insert(0);
        *slot = (*slot).max(next);
    }
}

impl Log for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, content: Bytes) -> Result<Message> {
        self.add_from(&self.sender_id, content)
    }

    fn register_reader(
        &self,
        marker: ReadMarker,
        reader: Arc<dyn MessageReader>,
    ) -> Result<ReaderId> {
        let id = ReaderId(self.next_reader.fetch_add(1, Ordering::Relaxed));
        let identifier = marker.identifier().map(str::to_string);
        let (start, backlog) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(UmbralError::Closed("log"));
            }
            let resume = identifier
                .as_ref()
                .and_then(|ident| state.positions.get(ident).copied());
            let start = match (&marker, resume) {
                (_, Some(position)) => position,
                (ReadMarker::FromNow | ReadMarker::FromIdentifierOrNow(_), None) => {
                    state.messages.len()
                }
                (ReadMarker::FromTime(ts) | ReadMarker::FromIdentifierOrTime(_, ts), None) => state
                    .messages
                    .iter()
                    .position(|m| m.timestamp >= *ts)
                    .unwrap_or(state.messages.len()),
            };
            let backlog: Vec<Message> = state.messages[start.min(state.messages.len())..].to_vec();
            state.readers.push(Registration {
                id,
                identifier: identifier.clone(),
                reader: Arc::clone(&reader),
            });
            (start, backlog)
        };
        debug!(log = %self.name, reader = id.0, start, backlog = backlog.len(), "log.register_reader");
        for (offset, message) in backlog.iter().enumerate() {
            reader.read(message);
            if let Some(identifier) = &identifier {
                self.advance(identifier.clone(), start + offset + 1);
            }
        }
        Ok(id)
    }

    fn unregister_reader(&self, id: ReaderId) -> bool {
        let mut state = self.state.lock();
        let before = state.readers.len();
        state.readers.retain(|r| r.id != id);
        before != state.readers.len()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.readers.clear();
        debug!(log = %self.name, "log.closed");
        Ok(())
    }
}

/// Manager handing out [`MemoryLog`]s by name.
pub struct MemoryLogManager {
    sender_id: String,
    clock: Arc<dyn TimeSource>,
    logs: DashMap<String, Arc<MemoryLog>>,
}

impl MemoryLogManager {
    /// Creates a manager whose logs stamp messages with `sender_id`.
    pub fn new(sender_id: impl Into<String>, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            sender_id: sender_id.into(),
            clock,
            logs: DashMap::new(),
        }
    }

    /// Concrete handle to a log, opening it on first use.
    pub fn memory_log(&self, name: &str) -> Arc<MemoryLog> {
        self.logs
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryLog::new(
                    name,
                    self.sender_id.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .clone()
    }
}

impl LogManager for MemoryLogManager {
    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn open_log(&self, name: &str) -> Result<Arc<dyn Log>> {
        Ok(self.memory_log(name) as Arc<dyn Log>)
    }

    fn close(&self) -> Result<()> {
        for log in self.logs.iter() {
            log.value().close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::clock::ManualClock;
    use crate::types::Timestamp;
    use std::time::Duration;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Bytes>>);

    impl MessageReader for Collect {
        fn read(&self, message: &Message) {
            self.0.lock().push(message.content.clone());
        }
    }

    fn setup() -> (Arc<ManualClock>, MemoryLog) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10)));
        let log = MemoryLog::new("txlog", "node-a", clock.clone() as Arc<dyn TimeSource>);
        (clock, log)
    }

    #[test]
    fn markers_pick_start_position() {
        let (clock, log) = setup();
        log.add(Bytes::from_static(b"1")).unwrap();
        clock.advance(Duration::from_millis(5));
        let cut = clock.now();
        log.add(Bytes::from_static(b"2")).unwrap();

        let now = Arc::new(Collect::default());
        let since = Arc::new(Collect::default());
        log.register_reader(ReadMarker::FromNow, now.clone()).unwrap();
        log.register_reader(ReadMarker::FromTime(cut), since.clone()).unwrap();
        log.add(Bytes::from_static(b"3")).unwrap();

        assert_eq!(now.0.lock().as_slice(), &[Bytes::from_static(b"3")]);
        assert_eq!(
            since.0.lock().as_slice(),
            &[Bytes::from_static(b"2"), Bytes::from_static(b"3")]
        );
    }

    #[test]
    fn identifier_resumes_after_last_delivery() {
        let (_clock, log) = setup();
        let first = Arc::new(Collect::default());
        let id = log
            .register_reader(ReadMarker::FromIdentifierOrNow("proc".into()), first.clone())
            .unwrap();
        log.add(Bytes::from_static(b"a")).unwrap();
        assert!(log.unregister_reader(id));
        assert!(!log.unregister_reader(id));
        log.add(Bytes::from_static(b"b")).unwrap();

        let second = Arc::new(Collect::default());
        log.register_reader(
            ReadMarker::FromIdentifierOrTime("proc".into(), Timestamp::EPOCH),
            second.clone(),
        )
        .unwrap();
        assert_eq!(first.0.lock().len(), 1);
        assert_eq!(second.0.lock().as_slice(), &[Bytes::from_static(b"b")]);
    }

    #[test]
    fn closed_log_rejects_appends() {
        let clock: Arc<dyn TimeSource> = Arc::new(ManualClock::default());
        let manager = MemoryLogManager::new("node-a", clock);
        let log = manager.open_log("user").unwrap();
        let msg = log.add(Bytes::from_static(b"x")).unwrap();
        assert_eq!(msg.sender_id, "node-a");
        manager.close().unwrap();
        assert!(matches!(log.add(Bytes::new()), Err(UmbralError::Closed(_))));
    }
}
