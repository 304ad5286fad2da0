//! Retry backoff

use rand::Rng;
use std::time::Duration;

/// Delay before the next attempt of a task that failed retryably
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// `n^4 + 15 + rand(0..30) * (n + 1)` seconds, `n` = retries so far
    #[default]
    Exponential,
    /// Same delay for every attempt
    Fixed(Duration),
}

impl RetryPolicy {
    pub fn delay(&self, retry_count: u32) -> Duration {
        match self {
            RetryPolicy::Exponential => {
                let jitter = rand::thread_rng().gen_range(0..30u64);
                Self::exponential_secs(retry_count, jitter)
            }
            RetryPolicy::Fixed(delay) => *delay,
        }
    }

    fn exponential_secs(retry_count: u32, jitter: u64) -> Duration {
        let n = u64::from(retry_count);
        let secs = n
            .saturating_pow(4)
            .saturating_add(15)
            .saturating_add(jitter.saturating_mul(n + 1));
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_formula() {
        assert_eq!(RetryPolicy::exponential_secs(0, 0), Duration::from_secs(15));
        assert_eq!(RetryPolicy::exponential_secs(2, 0), Duration::from_secs(31));
        assert_eq!(RetryPolicy::exponential_secs(2, 10), Duration::from_secs(61));
    }

    #[test]
    fn test_exponential_grows() {
        let policy = RetryPolicy::Exponential;
        for n in 0..10 {
            let lower = Duration::from_secs(u64::from(n).pow(4) + 15);
            let upper = lower + Duration::from_secs(29 * (u64::from(n) + 1));
            let delay = policy.delay(n);
            assert!(delay >= lower && delay <= upper, "retry {n}: {delay:?}");
        }
    }

    #[test]
    fn test_fixed() {
        let policy = RetryPolicy::Fixed(Duration::from_millis(5));
        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(9), Duration::from_millis(5));
    }
}
