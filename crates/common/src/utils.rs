//! Utility functions for the model lifecycle runtime

use std::time::Duration;
use std::future::Future;
use tokio::time::timeout;
use crate::error::LifecycleError;

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let base = 1024_f64;
    let exponent = (bytes_f64.ln() / base.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes_f64 / base.powi(exponent as i32);
    format!("{:.1} {}", value, UNITS[exponent])
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        return format!("{}ms", duration.subsec_millis());
    }

    let hours = total_secs / (60 * 60);
    let minutes = (total_secs % (60 * 60)) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();

    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }

    if minutes > 0 || !result.is_empty() {
        result.push_str(&format!("{}m ", minutes));
    }

    result.push_str(&format!("{}s", seconds));

    result
}

/// Executes a future with an optional deadline
///
/// A `None` limit runs the future to completion. On expiry the future is
/// dropped and [`LifecycleError::Timeout`] names the operation.
pub async fn execute_with_timeout<T, F>(
    future: F,
    limit: Option<Duration>,
    operation_name: &str,
) -> std::result::Result<T, LifecycleError>
where
    F: Future<Output = std::result::Result<T, LifecycleError>>,
{
    let Some(duration) = limit else {
        return future.await;
    };

    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(LifecycleError::Timeout(format!(
            "{} timed out after {}",
            operation_name,
            format_duration(duration)
        ))),
    }
}

/// Converts a millisecond setting into an optional limit (0 = unlimited)
pub fn optional_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_optional_millis() {
        assert_eq!(optional_millis(0), None);
        assert_eq!(optional_millis(1500), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_execute_with_timeout_expires() {
        let result: std::result::Result<(), _> = execute_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Some(Duration::from_millis(20)),
            "slow operation",
        )
        .await;

        assert!(matches!(result, Err(LifecycleError::Timeout(msg)) if msg.contains("slow operation")));
    }

    #[tokio::test]
    async fn test_execute_without_limit_runs_to_completion() {
        let result = execute_with_timeout(async { Ok(7) }, None, "quick").await;
        assert_eq!(result, Ok(7));
    }
}
