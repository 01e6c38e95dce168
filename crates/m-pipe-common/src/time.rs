//! ---
//! mpipe_section: "01-core-functionality"
//! mpipe_subsection: "module"
//! mpipe_type: "source"
//! mpipe_scope: "code"
//! mpipe_description: "Shared primitives and utilities for the pipeline runtime."
//! mpipe_version: "v0.0.0-prealpha"
//! mpipe_owner: "tbd"
//! ---
use chrono::Utc;

/// Current wall-clock time as whole epoch seconds; metric record resolution.
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Current wall-clock time in epoch milliseconds, for delay arithmetic.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Widen a second-resolution record timestamp to milliseconds, saturating.
pub fn seconds_to_millis(seconds: i64) -> i64 {
    seconds.saturating_mul(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_widen_saturating() {
        assert_eq!(seconds_to_millis(2), 2_000);
        assert_eq!(seconds_to_millis(i64::MAX), i64::MAX);
    }

    #[test]
    fn clocks_agree_on_resolution() {
        let secs = epoch_seconds();
        let millis = epoch_millis();
        assert!(millis / 1_000 - secs <= 1);
    }
}
