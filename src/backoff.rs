//! Requeue policy shared by all controllers.
//!
//! Transient failures back off exponentially per object key, from [`BASE_DELAY`] up to
//! [`MAX_DELAY`]. Hard failures (forbidden, invalid input) go straight to the slow rate. The
//! attempt counter only caps the delay, a key is never parked. A successful reconcile resets it,
//! and a key that has not failed for [`FORGET_AFTER`] is dropped, which covers deleted objects.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Fixed requeue while an asset's credentials secret is missing, secrets are not watched
pub const SECRET_NOT_FOUND_REQUEUE: Duration = Duration::from_secs(60);

/// A still failing key is requeued at least this often, so an older record belongs to an object
/// that recovered or went away
pub const FORGET_AFTER: Duration = Duration::from_secs(2 * 5 * 60);

/// In-place attempts for optimistic concurrency failures before bouncing to the queue
pub const CONFLICT_RETRY_BUDGET: u32 = 5;

/// Delay for the n-th consecutive failure (1-based), doubling from `base` and capped at `cap`
pub fn exponential_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift)
        .map_or(cap, |d| d.min(cap))
}

#[derive(Clone, Copy, Debug)]
struct Failures {
    attempts: u32,
    last: Instant,
}

#[derive(Default)]
pub struct ErrorBackoff {
    failures: Mutex<HashMap<String, Failures>>,
}

impl ErrorBackoff {
    /// Record a failure for `key` and return the action to hand back to the controller
    pub fn requeue(&self, key: &str, error: &Error) -> Action {
        self.requeue_at(key, error, Instant::now())
    }

    fn requeue_at(&self, key: &str, error: &Error, now: Instant) -> Action {
        match error {
            Error::AssetSecretNotFound { .. } => return Action::requeue(SECRET_NOT_FOUND_REQUEUE),
            // recorded in status, the deployment watch brings the asset back
            Error::ClusterDeploymentNotFound { .. } => return Action::await_change(),
            _ => {}
        }
        if !error.is_transient() {
            warn!(key, %error, "hard failure, requeueing at the slow rate");
            return Action::requeue(MAX_DELAY);
        }

        let attempt = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            failures.retain(|_, f| now.saturating_duration_since(f.last) < FORGET_AFTER);
            let entry = failures.entry(key.to_string()).or_insert(Failures {
                attempts: 0,
                last: now,
            });
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last = now;
            entry.attempts
        };
        let delay = exponential_delay(attempt, BASE_DELAY, MAX_DELAY);
        debug!(key, attempt, ?delay, "requeueing after failure");
        Action::requeue(delay)
    }

    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    fn attempts(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap()
            .get(key)
            .map(|f| f.attempts)
            .unwrap_or_default()
    }
}

/// Run `operation` until it succeeds or fails with anything other than a conflict.
///
/// The operation is expected to re-read the object it writes, so that each attempt carries a
/// fresh resource version.
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRY_BUDGET => {
                debug!(operation = operation_name, attempt, "conflict, retrying");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "test".into(),
            reason: "Test".into(),
            code,
        }))
    }

    #[test]
    fn delay_doubles_then_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(300);
        assert_eq!(exponential_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(exponential_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(exponential_delay(5, base, cap), Duration::from_secs(16));
        assert_eq!(exponential_delay(9, base, cap), Duration::from_secs(256));
        assert_eq!(exponential_delay(10, base, cap), cap);
        assert_eq!(exponential_delay(1000, base, cap), cap);
    }

    #[test]
    fn transient_failures_progress_and_reset() {
        let backoff = ErrorBackoff::default();
        let conflict = api_error(409);
        assert_eq!(
            backoff.requeue("ns/a", &conflict),
            Action::requeue(Duration::from_secs(1))
        );
        assert_eq!(
            backoff.requeue("ns/a", &conflict),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(backoff.attempts("ns/a"), 2);
        assert_eq!(backoff.attempts("ns/b"), 0);

        backoff.reset("ns/a");
        assert_eq!(backoff.attempts("ns/a"), 0);
    }

    #[test]
    fn forbidden_goes_to_slow_rate() {
        let backoff = ErrorBackoff::default();
        assert_eq!(
            backoff.requeue("c", &api_error(403)),
            Action::requeue(MAX_DELAY)
        );
        assert_eq!(backoff.attempts("c"), 0);
    }

    #[test]
    fn missing_secret_uses_fixed_interval() {
        let backoff = ErrorBackoff::default();
        let err = Error::AssetSecretNotFound {
            name: "my-secret".into(),
            namespace: "bar".into(),
        };
        for _ in 0..3 {
            assert_eq!(
                backoff.requeue("bar/mycluster", &err),
                Action::requeue(Duration::from_secs(60))
            );
        }
    }

    #[test]
    fn missing_deployment_waits_for_a_watch_event() {
        let backoff = ErrorBackoff::default();
        let err = Error::ClusterDeploymentNotFound {
            name: "mycluster".into(),
            namespace: "mycluster".into(),
        };
        assert_eq!(backoff.requeue("bar/asset", &err), Action::await_change());
        assert_eq!(backoff.attempts("bar/asset"), 0);
    }

    #[test]
    fn stale_keys_are_forgotten() {
        let backoff = ErrorBackoff::default();
        let conflict = api_error(409);
        let start = Instant::now();
        backoff.requeue_at("ns/deleted", &conflict, start);
        backoff.requeue_at("ns/deleted", &conflict, start);
        assert_eq!(backoff.attempts("ns/deleted"), 2);

        backoff.requeue_at("ns/other", &conflict, start + FORGET_AFTER);
        assert_eq!(backoff.attempts("ns/deleted"), 0);
        assert_eq!(backoff.attempts("ns/other"), 1);
    }

    #[tokio::test]
    async fn conflicts_are_retried_within_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_on_conflict("test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(api_error(409))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);

        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(409))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), CONFLICT_RETRY_BUDGET);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(404))
        })
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
