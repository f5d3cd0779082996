//! Bounded retry with exponential backoff for the connect and reload stages.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::prelude::{debug, warn};

/// Retry policy for the connect and reload stages.
///
/// The default makes a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per stage, at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "millis")]
    pub min_backoff: Duration,
    /// Upper bound for the delay between attempts.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// A policy making `max_attempts` attempts with the default backoff bounds.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Returns a copy with sane bounds: at least one attempt, and
    /// `min_backoff <= max_backoff`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }

    /// Runs `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// Returns the last error, or `None` if cancelled while waiting.
    pub(crate) async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, Option<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let policy = self.normalized();
        let mut backoff = policy.min_backoff;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= policy.max_attempts => return Err(Some(e)),
                Err(e) => {
                    warn!(
                        "{what} failed (attempt {attempt}/{}): {e}; retrying in {backoff:?}",
                        policy.max_attempts
                    );
                }
            }

            if sleep_or_cancel(cancel, backoff).await {
                debug!("{what} retry cancelled");
                return Err(None);
            }
            backoff = next_backoff(backoff, policy.max_backoff);
            attempt += 1;
        }
    }
}

/// Sleeps for `dur`; returns `true` if `token` fired first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Doubles `current`, capped at `max`, plus up to 10% jitter (still capped).
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::ZERO;
    }

    let jitter = base / 10;
    let add = if jitter > 0 { fastrand::u64(0..=jitter) } else { 0 };
    Duration::from_millis(base.saturating_add(add).min(max))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(10);
        for _ in 0..100 {
            let next = next_backoff(Duration::from_millis(200), max);
            assert!(next >= Duration::from_millis(400));
            assert!(next <= Duration::from_millis(440));
        }
        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(Duration::ZERO, max), Duration::ZERO);
    }

    #[test]
    fn normalized_fixes_bounds() {
        let cfg = RetryConfig {
            max_attempts: 0,
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(1),
        }
        .normalized();
        assert_eq!(cfg.max_attempts, 1);
        assert!(cfg.min_backoff <= cfg.max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryConfig::attempts(3);

        let out: Result<u32, Option<String>> = policy
            .run("connect", &CancellationToken::new(), move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(out.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let policy = RetryConfig::attempts(2);
        let out: Result<(), Option<&str>> = policy
            .run("reload", &CancellationToken::new(), || async { Err("boom") })
            .await;
        assert_eq!(out.unwrap_err(), Some("boom"));
    }

    #[tokio::test]
    async fn default_policy_does_not_retry() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), Option<&str>> = RetryConfig::default()
            .run("connect", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("refused")
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out: Result<(), Option<&str>> = RetryConfig::attempts(5)
            .run("connect", &cancel, || async { Err("refused") })
            .await;
        assert_eq!(out.unwrap_err(), None);
    }
}
