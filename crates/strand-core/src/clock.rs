//! Wall-clock time shared across processes.
//!
//! Heartbeats written into shared memory are compared by other processes,
//! so they use milliseconds since the Unix epoch rather than `Instant`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
