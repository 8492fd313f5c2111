use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::Result;

/// Named thread that runs an action on a fixed interval until asked to stop.
///
/// Stopping is cooperative: [`BackgroundWorker::stop`] raises a flag, wakes the
/// thread if it is waiting, and waits a bounded time for the current action to
/// finish. An action that overruns the bound is left to complete on its own.
pub struct BackgroundWorker {
    name: String,
    inner: Arc<Inner>,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

struct Inner {
    stop: Mutex<bool>,
    wake: Condvar,
}

impl BackgroundWorker {
    /// Spawns the worker; `action` runs immediately and then once per `interval`.
    pub fn spawn<F>(name: &str, interval: Duration, mut action: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let (done_tx, done) = mpsc::channel();
        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    if *thread_inner.stop.lock() {
                        break;
                    }
                    action();
                    let mut stop = thread_inner.stop.lock();
                    if !*stop {
                        thread_inner.wake.wait_for(&mut stop, interval);
                    }
                    if *stop {
                        break;
                    }
                }
                let _ = done_tx.send(());
            })?;
        debug!(worker = name, ?interval, "background.spawned");
        Ok(Self {
            name: name.to_string(),
            inner,
            handle: Some(handle),
            done,
        })
    }

    /// Returns `true` while the thread has not been stopped.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Signals the worker to stop and waits up to `max_wait` for it to exit.
    ///
    /// Returns `true` if the thread exited within the bound.
    pub fn stop(&mut self, max_wait: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        *self.inner.stop.lock() = true;
        self.inner.wake.notify_all();
        match self.done.recv_timeout(max_wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "background.panicked");
                }
                debug!(worker = %self.name, "background.stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?max_wait, "background.stop_timeout");
                false
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}
