//! ABOUTME: Retry delay computation with exponential backoff and jitter
//! ABOUTME: delay = min(base * 2^attempt, cap) + jitter(0..1s)

use co_config::RetryConfig;
use std::time::Duration;

/// Compute the backoff delay before the next try.
///
/// `attempt` is the number of tries already made (0 after the first
/// failure). Jitter is derived from subsecond nanos so concurrent
/// failures spread out without a shared RNG.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .base_ms
        .saturating_mul(1u64 << attempt.min(32));
    let capped = exp.min(config.cap_ms);

    let jitter_ms = {
        use std::time::SystemTime;
        let nanos = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        nanos % 1000
    };

    Duration::from_millis(capped + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            base_ms: 1_000,
            cap_ms: 300_000,
        }
    }

    #[test]
    fn test_exponential_growth_within_jitter() {
        let config = config();

        let first = retry_delay(&config, 0);
        assert!(first >= Duration::from_millis(1_000));
        assert!(first < Duration::from_millis(2_000));

        let second = retry_delay(&config, 1);
        assert!(second >= Duration::from_millis(2_000));
        assert!(second < Duration::from_millis(3_000));

        let third = retry_delay(&config, 2);
        assert!(third >= Duration::from_millis(4_000));
        assert!(third < Duration::from_millis(5_000));
    }

    #[test]
    fn test_cap_applies() {
        let config = config();
        // 2^30 seconds would be absurd without the cap
        let delay = retry_delay(&config, 30);
        assert!(delay >= Duration::from_millis(300_000));
        assert!(delay < Duration::from_millis(301_000));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let config = config();
        let delay = retry_delay(&config, u32::MAX);
        assert!(delay < Duration::from_millis(301_000));
    }
}
