//! Shared exponential back-off helper.
//!
//! Used by both the HTTP fallback store adapter's retry policy and the
//! relay client's reconnect policy, so the two share one small
//! implementation instead of each growing its own loop.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

const BASE_DELAY: Duration = Duration::from_millis(250);

/// Retry `f` up to `attempts` times, doubling the delay after each failure
/// starting from [`BASE_DELAY`] and capping at `cap`. Returns the first
/// success, or the last error once `attempts` is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(attempts: u32, cap: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = BASE_DELAY;
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(cap);
                }
            }
        }
    }
    Err(last_err.expect("attempts > 0"))
}

/// Compute the reconnect delay for connection attempt `errors` (0-indexed),
/// doubling from [`BASE_DELAY`] and capped at `cap`. Used by the relay
/// client (cap 5 min) and the safety-net timer's skip probability (cap
/// 16x the base interval).
pub fn delay_for_attempt(errors: u32, cap: Duration) -> Duration {
    let factor = 1u64.checked_shl(errors.min(32)).unwrap_or(u64::MAX);
    BASE_DELAY.checked_mul(factor as u32).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(10), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(crate::error::Error::Store("busy".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts_exhausted() {
        let result: Result<()> = retry_with_backoff(2, Duration::from_millis(5), || async {
            Err(crate::error::Error::Store("still busy".into()))
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn delay_for_attempt_caps() {
        let cap = Duration::from_secs(300);
        assert!(delay_for_attempt(0, cap) <= cap);
        assert_eq!(delay_for_attempt(20, cap), cap);
    }
}
