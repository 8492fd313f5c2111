//! Low-level primitives shared by the locking and recovery subsystems.
//!
//! Includes byte utilities, injectable clocks, bounded retries, and
//! background worker threads.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving integers, varints, and a checked reader used by the
/// lock-claim and transaction-log codecs.
pub mod bytes;

/// Wall-clock and simulated time sources.
pub mod clock;

/// Concurrency primitives and background threads.
pub mod concurrency;

/// Retry-with-budget helper for backend calls.
pub mod retry;
