//! Wall-clock access and timestamp formatting.
//!
//! All timestamps are unix milliseconds (`i64`). The store compares them with
//! plain integer arithmetic in SQL, so there is exactly one conversion point:
//! here.

use chrono::{DateTime, Utc};

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Formats a unix-millisecond timestamp as RFC 3339 (second precision).
pub fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Parses a user-supplied timestamp into unix milliseconds.
///
/// Accepts RFC 3339 (`2025-11-08T15:30:00Z`, with or without offset) and
/// naive `YYYY-MM-DDTHH:MM:SS`, which is taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc).timestamp_millis());
    }

    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_naive_forms() {
        let with_zone = parse_timestamp("2025-11-08T15:30:00Z").unwrap();
        let naive = parse_timestamp("2025-11-08T15:30:00").unwrap();
        assert_eq!(with_zone, naive);

        assert_eq!(format_ms(with_zone), "2025-11-08T15:30:00Z");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("tomorrow").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
