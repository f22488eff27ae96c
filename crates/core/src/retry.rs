use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded (or unbounded) attempt budget with a fixed pause between attempts.
///
/// Shared by the remote executor, which retries failed commands, and by the
/// convergence waiters, which poll provider state until it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts),
            interval,
        }
    }

    pub const fn forever(interval: Duration) -> Self {
        RetryPolicy {
            max_attempts: None,
            interval,
        }
    }

    /// Whether attempt number `attempt` (1-based) is inside the budget.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    /// Run `op` until it succeeds or the budget is spent, returning the last
    /// error in the latter case. `on_retry` sees each failure that will be
    /// followed by another attempt.
    pub async fn retry<T, E, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !self.allows(attempt + 1) {
                        debug!(attempt, "retry budget spent");
                        return Err(err);
                    }
                    on_retry(attempt, &err);
                    debug!(attempt, interval_ms = self.interval.as_millis() as u64, "retrying");
                    self.pause().await;
                    attempt += 1;
                }
            }
        }
    }

    /// Call `check` until it yields a value, waiting one interval before
    /// every call including the first, so the state being polled has time
    /// to exist. Errors end polling immediately.
    /// Returns `Ok(None)` when the attempt budget runs out first.
    pub async fn poll_until<T, E, F, Fut>(&self, mut check: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let mut attempt = 1;
        loop {
            self.pause().await;
            if let Some(value) = check(attempt).await? {
                return Ok(Some(value));
            }
            if !self.allows(attempt + 1) {
                debug!(attempt, "poll budget spent");
                return Ok(None);
            }
            debug!(attempt, "not settled yet");
            attempt += 1;
        }
    }

    async fn pause(&self) {
        if !self.interval.is_zero() {
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<u32, String> = policy
            .retry(
                |attempt| {
                    calls.set(calls.get() + 1);
                    async move {
                        if attempt < 2 {
                            Err("refused".to_string())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_, _| {},
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn retry_returns_last_error_when_budget_spent() {
        let retries = Cell::new(0);
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<(), String> = policy
            .retry(
                |attempt| async move { Err(format!("attempt {}", attempt)) },
                |_, _| retries.set(retries.get() + 1),
            )
            .await;
        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(retries.get(), 2);
    }

    #[tokio::test]
    async fn poll_until_gives_up_after_budget() {
        let policy = RetryPolicy::fixed(4, Duration::ZERO);
        let result: Result<Option<()>, String> = policy.poll_until(|_| async { Ok(None) }).await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn poll_until_propagates_errors() {
        let policy = RetryPolicy::forever(Duration::ZERO);
        let result: Result<Option<()>, String> = policy
            .poll_until(|attempt| async move {
                if attempt == 3 {
                    Err("throttled".to_string())
                } else {
                    Ok(None)
                }
            })
            .await;
        assert_eq!(result, Err("throttled".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_waits_an_interval_before_the_first_check() {
        let start = tokio::time::Instant::now();
        let checked_at = Cell::new(Vec::new());
        let policy = RetryPolicy::forever(Duration::from_secs(10));
        let result: Result<Option<u32>, String> = policy
            .poll_until(|attempt| {
                let mut seen = checked_at.take();
                seen.push(start.elapsed());
                checked_at.set(seen);
                async move { Ok((attempt == 2).then_some(attempt)) }
            })
            .await;
        assert_eq!(result, Ok(Some(2)));
        let seen = checked_at.take();
        assert_eq!(seen.len(), 2);
        assert!(seen[0] >= Duration::from_secs(10));
        assert!(seen[1] >= Duration::from_secs(20));
    }

    #[test]
    fn unbounded_policy_allows_any_attempt() {
        let policy = RetryPolicy::forever(Duration::from_secs(5));
        assert!(policy.allows(10_000));
        assert!(!RetryPolicy::fixed(3, Duration::ZERO).allows(4));
    }
}
