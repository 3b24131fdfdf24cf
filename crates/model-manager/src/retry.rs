//! Retry policy for downloads
//!
//! Exponential backoff with multiplicative jitter. Attempts are numbered from
//! 1; the delay after attempt `n` is
//! `min(max_delay, base_delay * multiplier^(n-1) * jitter)` with jitter drawn
//! uniformly from `[0.8, 1.2]`.

use std::time::Duration;
use rand::Rng;

use runtime_config::DownloadConfiguration;

/// HTTP statuses that are worth another attempt
pub const RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// Lower jitter bound
pub const JITTER_MIN: f64 = 0.8;

/// Upper jitter bound
pub const JITTER_MAX: f64 = 1.2;

/// Returns true if an HTTP status is retryable
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Backoff schedule of one download
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Delay after the first failed attempt, before jitter
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfiguration) -> Self {
        Self {
            retry_count: config.retry_count,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Total attempts allowed, the first one included
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Returns true if another attempt may follow attempt number `attempt`
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay after attempt `attempt` before jitter and capping
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if seconds.is_finite() && seconds < self.max_delay.as_secs_f64() * 2.0 {
            Duration::from_secs_f64(seconds)
        } else {
            // beyond any jitter reach of the cap
            self.max_delay.saturating_mul(2)
        }
    }

    /// Jittered, capped delay after attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, jitter)
    }

    /// Delay after attempt `attempt` for a given jitter factor
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        self.nominal_delay(attempt).mul_f64(jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DownloadConfiguration::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retry_count: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [408, 425, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{}", status);
        }
        for status in [400, 401, 403, 404, 410, 501] {
            assert!(!is_retryable_status(status), "{}", status);
        }
    }

    #[test]
    fn test_delays_stay_within_jitter_bounds() {
        let policy = policy();
        for attempt in 1..=3u32 {
            let nominal = Duration::from_millis(100 * 2u64.pow(attempt - 1));
            let low = nominal.mul_f64(JITTER_MIN).min(policy.max_delay);
            let high = nominal.mul_f64(JITTER_MAX).min(policy.max_delay);
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay >= low && delay <= high, "attempt {}: {:?}", attempt, delay);
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_with_jitter(10, JITTER_MAX), Duration::from_secs(1));
        assert_eq!(policy.delay_with_jitter(u32::MAX, JITTER_MIN), Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = policy();
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.allows_retry_after(3));
        assert!(!policy.allows_retry_after(4));

        let no_retries = RetryPolicy {
            retry_count: 0,
            ..policy
        };
        assert!(!no_retries.allows_retry_after(1));
    }
}
