//! Wall-clock helpers.
//!
//! Timestamps shared through the coordination store are UTC unix
//! milliseconds so that peers on different hosts can compare them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current UTC time as unix milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Milliseconds elapsed between `earlier_ms` and `now_ms`, saturating at zero
/// when the clocks disagree.
pub fn millis_since(earlier_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(now_ms.saturating_sub(earlier_ms))
}

/// Parse a duration string like "250ms", "5s" or "1m".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
