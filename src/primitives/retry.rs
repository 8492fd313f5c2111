//! Bounded retries for backend operations.

use std::time::Duration;

use tracing::{debug, warn};

use super::clock::TimeSource;
use crate::types::{Result, UmbralError};

const BASE_REATTEMPT: Duration = Duration::from_millis(50);
const MAX_REATTEMPT: Duration = Duration::from_secs(1);

/// Runs `op` until it succeeds, fails permanently, or `budget` elapses on `clock`.
///
/// Temporary failures (see [`UmbralError::is_temporary`]) are retried with doubling
/// waits; any other error is returned immediately. Once the budget is spent the last
/// temporary error is wrapped into [`UmbralError::Timeout`].
pub fn execute<T, F>(clock: &dyn TimeSource, what: &str, budget: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let started = clock.now();
    let mut wait = BASE_REATTEMPT;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_temporary() => {
                let now = clock.now();
                let elapsed = now.duration_since(started);
                if elapsed >= budget {
                    warn!(op = what, attempt, error = %err, "retry.budget_exhausted");
                    return Err(UmbralError::Timeout(budget));
                }
                debug!(op = what, attempt, error = %err, "retry.temporary_failure");
                clock.sleep_past(now.plus(wait.min(budget - elapsed)));
                wait = (wait * 2).min(MAX_REATTEMPT);
            }
            Err(err) => return Err(err),
        }
    }
}
