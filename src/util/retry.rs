use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Bounded retry budget shared by every component that retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Backoff::None)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned in the latter cases.
///
/// `op` receives the 1-based attempt number and the previous attempt's error,
/// so callers can feed failure details into the next try.
pub async fn retry<T, E, F, Fut, R>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut(u32, Option<&E>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    let mut previous: Option<E> = None;

    loop {
        let pending = op(attempt, previous.as_ref());
        let error = match pending.await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts || !is_retryable(&error) {
            return Err(error);
        }

        let delay = policy.backoff.delay(attempt);
        warn!(
            operation,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        previous = Some(error);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn stops_after_max_attempts_with_last_error() {
        let calls = Mutex::new(Vec::new());
        let result: Result<(), String> = retry(
            RetryPolicy::new(3, Backoff::None),
            "test",
            |attempt, previous: Option<&String>| {
                calls.lock().unwrap().push((attempt, previous.cloned()));
                async move { Err(format!("failure {attempt}")) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        let calls = calls.into_inner().unwrap();
        assert_eq!(
            calls,
            vec![
                (1, None),
                (2, Some("failure 1".to_string())),
                (3, Some("failure 2".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let mut calls = 0;
        let result: Result<(), String> = retry(
            RetryPolicy::new(5, Backoff::None),
            "test",
            |_, _: Option<&String>| {
                calls += 1;
                async { Err("fatal".to_string()) }
            },
            |e| e != "fatal",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let result: Result<u32, String> = retry(
            RetryPolicy::new(4, Backoff::Fixed(Duration::from_millis(1))),
            "test",
            |attempt, _: Option<&String>| async move {
                if attempt < 3 { Err("not yet".to_string()) } else { Ok(attempt) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
    }
}
