//! Retry and backoff primitives.
//!
//! This library provides the retry building blocks used by the Docker
//! control adapter and the sidecar HTTP client:
//!
//! - **`BackoffPolicy`**: exponential backoff with jitter, used when waiting
//!   on an external system to converge (e.g. a Swarm task to start).
//! - **`RetryPolicy`**: a fixed, bounded delay schedule for transient
//!   transport errors (e.g. 1s/4s/8s).
//! - **`retry_transient`**: runs an async operation under a `RetryPolicy`,
//!   retrying only errors the caller classifies as transient and re-raising
//!   the last error unmodified once attempts are exhausted.
//! - **`RetryBudget`**: a windowed failure counter; exhaustion is the signal
//!   to stop auto-healing and escalate to an operator.
//!
//! # Invariants
//!
//! - Non-transient errors are never retried
//! - The schedule is bounded; no helper here loops forever
//! - Budget exhaustion is sticky within its window

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(20),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        // Jitter spreads out concurrent retries so clients do not hammer a
        // struggling engine in lockstep.
        let jitter_range = delay * self.jitter;
        let jitter = rand_jitter(jitter_range);
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Jitter from a clock-seeded LCG; uniformity is not required here.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

/// A bounded, fixed delay schedule for transient transport errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Create a policy from an explicit delay schedule.
    ///
    /// The number of delays equals the number of retries; the operation is
    /// attempted `delays.len() + 1` times in total.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// The schedule used for sidecar transport errors: 1s, 4s, 8s.
    pub fn transient_default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(8),
        ])
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Total number of attempts (initial call + retries).
    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Delay before retry number `n` (0-based), if any remain.
    pub fn delay_before_retry(&self, n: usize) -> Option<Duration> {
        self.delays.get(n).copied()
    }
}

/// Run `op` under `policy`, retrying only errors for which `is_transient`
/// returns true. The last error is returned unmodified once the schedule is
/// exhausted; non-transient errors are returned immediately.
pub async fn retry_transient<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    is_transient: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retry = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                let Some(delay) = policy.delay_before_retry(retry) else {
                    return Err(err);
                };
                debug!(
                    retry = retry + 1,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Windowed failure counter for escalation decisions.
///
/// Each resource key gets `max_attempts` failed attempts per `window`; the
/// call recording the final allowed attempt reports exhaustion, and the
/// caller is expected to stop auto-healing that resource. A success wipes
/// the key via [`RetryBudget::clear`].
#[derive(Debug, Clone)]
pub struct RetryBudget {
    /// Failed attempts allowed per resource inside the window. A budget of
    /// zero tolerates nothing and escalates on the first failure.
    max_attempts: u32,

    /// Window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failed attempt for a resource.
    ///
    /// Returns true once the budget for that resource is spent.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();
        let entry = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Failures older than the window no longer count.
        if now.duration_since(entry.1) > self.window {
            *entry = (0, now);
        }

        entry.0 += 1;
        entry.0 >= self.max_attempts
    }

    /// True while the resource's budget is spent and the window still holds.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        self.failures
            .get(resource_key)
            .is_some_and(|(count, first)| {
                first.elapsed() <= self.window && *count >= self.max_attempts
            })
    }

    /// Forget a resource's failures (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default failure limit before escalating to manual intervention.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default escalation window.
pub const DEFAULT_BUDGET_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_policy_schedule() {
        let policy = RetryPolicy::transient_default();
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.delay_before_retry(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before_retry(2), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_before_retry(3), None);
    }

    #[tokio::test]
    async fn test_retry_transient_succeeds_after_retries() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(1); 3]);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_transient(
            &policy,
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("connection refused".to_string())
                } else {
                    Ok(7)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_reraises_last_error() {
        let policy = RetryPolicy::new(vec![Duration::from_millis(1); 2]);
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_transient(
            &policy,
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("attempt {n}"))
            },
        )
        .await;

        // 1 initial attempt + 2 retries; the final error wins.
        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_skips_non_transient() {
        let policy = RetryPolicy::transient_default();
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = retry_transient(
            &policy,
            |e: &String| e.contains("transient"),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_budget_spent_by_the_final_allowed_failure() {
        let mut budget = RetryBudget::new(3, Duration::from_secs(60));

        assert!(!budget.record_failure("qy-sidecar_a"));
        assert!(!budget.record_failure("qy-sidecar_a"));
        assert!(budget.record_failure("qy-sidecar_a"));

        assert!(budget.is_exhausted("qy-sidecar_a"));
        // Other resources keep their own budget.
        assert!(!budget.is_exhausted("qy-sidecar_b"));
    }

    #[test]
    fn test_budget_clear_starts_over() {
        let mut budget = RetryBudget::new(1, Duration::from_secs(60));

        assert!(budget.record_failure("qy-sidecar_a"));
        budget.clear("qy-sidecar_a");
        assert!(!budget.is_exhausted("qy-sidecar_a"));
        // The next failure spends a fresh budget, not the old count.
        assert!(budget.record_failure("qy-sidecar_a"));
    }

    #[test]
    fn test_budget_forgets_failures_outside_the_window() {
        let mut budget = RetryBudget::new(2, Duration::from_millis(1));

        assert!(!budget.record_failure("qy-sidecar_a"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!budget.record_failure("qy-sidecar_a"));
        assert!(!budget.is_exhausted("qy-sidecar_a"));
    }

    #[test]
    fn test_budget_prune_drops_expired_entries() {
        let mut budget = RetryBudget::new(1, Duration::from_millis(1));

        assert!(budget.record_failure("qy-sidecar_a"));
        std::thread::sleep(Duration::from_millis(5));
        budget.prune();
        assert!(!budget.is_exhausted("qy-sidecar_a"));
    }
}
