//! Wall-clock helpers.
//!
//! Playout scheduling and arrival stamps use nanoseconds since the Unix
//! epoch so both bridge endpoints talk about the same timeline.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Microseconds since the Unix epoch.
pub fn wall_clock_us() -> u64 {
    wall_clock_ns() / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let a = wall_clock_ns();
        let b = wall_clock_ns();
        assert!(b >= a);
        assert!(wall_clock_us() >= a / 1_000);
        assert!(a > 1_600_000_000 * 1_000_000_000); // after 2020
    }
}
