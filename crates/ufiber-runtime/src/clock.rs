//! Monotonic clock for activation timestamps
//!
//! Nanoseconds since the first call in this process.

use std::sync::OnceLock;
use std::time::Instant;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Pin the epoch now (otherwise pinned by the first `now_ns`)
pub fn init() {
    let _ = START_INSTANT.get_or_init(Instant::now);
}

#[inline]
pub fn now_ns() -> u64 {
    START_INSTANT
        .get_or_init(Instant::now)
        .elapsed()
        .as_nanos() as u64
}
