//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the connector runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock time as Unix milliseconds, the timestamp unit of every record.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert an instant into Unix milliseconds.
pub fn datetime_to_millis(instant: &DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datetime_converts_to_millis() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(datetime_to_millis(&instant), 1_704_110_400_000);
    }

    #[test]
    fn unix_millis_is_recent() {
        assert!(unix_millis() > 1_704_110_400_000);
    }

    #[test]
    fn duration_saturates() {
        assert_eq!(duration_to_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }
}
