//! Composable resilience strategies for external calls.
//!
//! Three wrappers protect calls to collaborators like the Kanban sink and
//! the classifier: [`RetryPolicy`] (exponential backoff, recoverable errors
//! only), [`CircuitBreaker`] (per named resource, fails fast after a
//! failure burst), and [`with_fallback`] (degrade to a secondary path on
//! recoverable failures). They compose freely; retry inside a breaker
//! inside a fallback is the usual stack for collaborator calls.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::error::MarcusError;

/// Exponential backoff retry for recoverable errors.
///
/// Non-recoverable errors are returned immediately, never retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Fast policy for tests: no waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, false)
    }

    /// Run `op`, retrying recoverable failures with backoff
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.recoverable || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after recoverable failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Backoff before the given retry attempt (1-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        if !self.jitter || exp.is_zero() {
            return exp;
        }
        // Equal jitter: half fixed, half random
        let half = exp / 2;
        half + exp.mul_f64(0.5 * rand::random::<f64>())
    }
}

/// Circuit breaker states, reported for observability and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

enum Phase {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { probe_in_flight: bool },
}

/// Per-resource circuit breaker.
///
/// Opens after `failure_threshold` consecutive failures; while open, calls
/// fail fast with a transient circuit-open error. After `recovery_timeout`
/// a single probe call is admitted: success closes the breaker, failure
/// reopens it.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    phase: Mutex<Phase>,
}

impl CircuitBreaker {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            phase: Mutex::new(Phase::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Self::DEFAULT_FAILURE_THRESHOLD,
            Self::DEFAULT_RECOVERY_TIMEOUT,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        match *self.phase.lock().unwrap() {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Run `op` under the breaker.
    ///
    /// The lock is only held to inspect and update the phase, never across
    /// the call itself.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_probe = {
            let mut phase = self.phase.lock().unwrap();
            match &mut *phase {
                Phase::Closed { .. } => false,
                Phase::Open { opened_at } => {
                    if opened_at.elapsed() >= self.recovery_timeout {
                        *phase = Phase::HalfOpen {
                            probe_in_flight: true,
                        };
                        true
                    } else {
                        return Err(MarcusError::circuit_open(&self.name));
                    }
                }
                Phase::HalfOpen { probe_in_flight } => {
                    if *probe_in_flight {
                        return Err(MarcusError::circuit_open(&self.name));
                    }
                    *probe_in_flight = true;
                    true
                }
            }
        };

        let result = op().await;

        let mut phase = self.phase.lock().unwrap();
        match &result {
            Ok(_) => {
                if is_probe {
                    tracing::info!(resource = %self.name, "Circuit breaker closed after successful probe");
                }
                *phase = Phase::Closed {
                    consecutive_failures: 0,
                };
            }
            Err(err) => {
                if is_probe {
                    tracing::warn!(resource = %self.name, error = %err, "Circuit breaker probe failed; reopening");
                    *phase = Phase::Open {
                        opened_at: Instant::now(),
                    };
                } else if let Phase::Closed {
                    consecutive_failures,
                } = &mut *phase
                {
                    *consecutive_failures += 1;
                    if *consecutive_failures >= self.failure_threshold {
                        tracing::warn!(
                            resource = %self.name,
                            failures = *consecutive_failures,
                            "Circuit breaker opened"
                        );
                        *phase = Phase::Open {
                            opened_at: Instant::now(),
                        };
                    }
                }
            }
        }
        result
    }
}

/// Run `primary`; on a recoverable error, run `fallback` instead.
///
/// Non-recoverable errors propagate without invoking the fallback.
pub async fn with_fallback<T, P, PFut, F, FFut>(primary: P, fallback: F) -> Result<T>
where
    P: FnOnce() -> PFut,
    PFut: Future<Output = Result<T>>,
    F: FnOnce() -> FFut,
    FFut: Future<Output = Result<T>>,
{
    match primary().await {
        Ok(value) => Ok(value),
        Err(err) if err.recoverable => {
            tracing::debug!(error = %err, "Primary failed; using fallback");
            fallback().await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MarcusError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_stops_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(3);
        let result: Result<()> = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MarcusError::transient("still down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_never_repeats_non_recoverable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(5);
        let result: Result<()> = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MarcusError::business_logic("rule broken"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::immediate(5);
        let result = policy
            .run(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MarcusError::transient("warming up"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(350),
            false,
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350)); // capped
    }

    #[test]
    fn jittered_backoff_stays_in_range() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_secs(60),
            true,
        );
        for _ in 0..50 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(100), "{d:?}");
            assert!(d <= Duration::from_millis(200), "{d:?}");
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(MarcusError::integration("boom")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(1) }).await
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("classifier", 5, Duration::from_secs(60));

        for _ in 0..5 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Sixth call never reaches the operation
        let ran = Arc::new(AtomicU32::new(0));
        let err = breaker
            .call(|| {
                let ran = ran.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), MarcusError>(())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn breaker_probe_success_closes() {
        let breaker = CircuitBreaker::new("kanban", 2, Duration::from_millis(20));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn breaker_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("kanban", 1, Duration::from_millis(20));
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        // And it fails fast again until the next recovery window
        assert!(succeed(&breaker).await.is_err());
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("kanban", 3, Duration::from_secs(60));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_runs_on_recoverable_errors_only() {
        let used = with_fallback(
            || async { Err::<u32, _>(MarcusError::transient("down")) },
            || async { Ok(7) },
        )
        .await
        .unwrap();
        assert_eq!(used, 7);

        let err = with_fallback(
            || async { Err::<u32, _>(MarcusError::security("denied")) },
            || async { Ok(7) },
        )
        .await
        .unwrap_err();
        assert!(err.is_unauthorized());
    }
}
