//! A process-monotonic millisecond clock.
//!
//! Endpoint timestamps (`created`, `last_activity`, `connected`,
//! `handshake_started`) are read from the handler thread and written from
//! the loop thread (and vice versa), so they are stored as `AtomicI64`
//! millisecond offsets from process start rather than as `Instant`, which
//! has no atomic representation.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call to any clock function in this
/// process. Monotonic; safe to compare across threads.
pub fn now_millis() -> i64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}
