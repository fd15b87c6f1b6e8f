//! Wall-clock helpers shared by both engines.
//!
//! Engines sample the clock once per event and pass the value down, so the
//! pure components stay deterministic under test.

use std::time::{SystemTime, UNIX_EPOCH};

/// Unix time in milliseconds; drives replay ageing and cache TTLs.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Unix time in seconds; stamped into long-identifier headers.
pub(crate) fn unix_secs() -> u32 {
    (unix_millis() / 1000) as u32
}
