//! Exponential retry backoff.

/// Seconds to wait before the next retry: `min(base^attempts, cap)`.
///
/// `attempts` is the failure count *after* incrementing for the execution
/// that just failed, so the first retry waits `base` seconds. Saturates at
/// `cap` when the power overflows.
pub fn retry_delay_secs(attempts: u32, base: i64, cap: i64) -> i64 {
    let delay = base.checked_pow(attempts).unwrap_or(cap);
    delay.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_until_cap() {
        assert_eq!(retry_delay_secs(1, 2, 300), 2);
        assert_eq!(retry_delay_secs(2, 2, 300), 4);
        assert_eq!(retry_delay_secs(3, 2, 300), 8);
        assert_eq!(retry_delay_secs(8, 2, 300), 256);
        assert_eq!(retry_delay_secs(9, 2, 300), 300);
        assert_eq!(retry_delay_secs(100, 2, 300), 300);
    }

    #[test]
    fn base_one_is_constant() {
        for attempts in 1..20 {
            assert_eq!(retry_delay_secs(attempts, 1, 300), 1);
        }
    }

    #[test]
    fn overflow_saturates_at_cap() {
        assert_eq!(retry_delay_secs(u32::MAX, 10, 600), 600);
    }
}
