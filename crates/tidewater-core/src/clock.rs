//! Wall-clock helpers. All persisted timestamps are unix epoch milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `n` seconds expressed in milliseconds.
pub const fn secs(n: u64) -> u64 {
    n * 1_000
}

/// `n` minutes expressed in milliseconds.
pub const fn minutes(n: u64) -> u64 {
    n * 60_000
}
