//! Circuit breaker for outbound calls to remote dependencies.
//!
//! One [`CircuitBreaker`] guards one logical dependency key. States:
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls are rejected immediately until the reset timeout elapses
//! - HalfOpen: a single trial call tests the dependency
//!
//! ```ignore
//! let breaker = CircuitBreaker::new("policy-source", CircuitBreakerConfig::default());
//! let body = breaker.execute(|| client.get(url).send()).await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CircuitBreakerConfig;

// =============================================================================
// State
// =============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition: Instant,
}

impl BreakerInner {
    fn transition(&mut self, key: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.last_transition = Instant::now();
        match to {
            CircuitState::Open => {
                self.opened_at = Some(self.last_transition);
                tracing::warn!(
                    breaker = key,
                    from = %from,
                    consecutive_failures = self.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = key, "Circuit breaker half-open, allowing trial call");
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                tracing::info!(breaker = key, from = %from, "Circuit breaker closed");
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit '{key}' is open")]
    CircuitOpen { key: String },

    /// The operation did not finish within the per-call timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed.
    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if the call was rejected by an open circuit.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Consecutive-failure circuit breaker for one dependency.
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the given dependency key.
    #[must_use]
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                last_transition: Instant::now(),
            }),
        }
    }

    /// The dependency key this breaker guards.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state. An open circuit whose timeout has elapsed still reports
    /// `Open` until the next call claims the trial.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Time since the last state transition.
    #[must_use]
    pub fn since_last_transition(&self) -> Duration {
        self.inner.lock().last_transition.elapsed()
    }

    /// Forces the breaker back to `Closed`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            inner.transition(&self.key, CircuitState::Closed);
        }
        inner.consecutive_failures = 0;
    }

    /// Runs `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// - `BreakerError::CircuitOpen` if the circuit rejects the call
    /// - `BreakerError::Timeout` if the per-call timeout elapses
    /// - `BreakerError::Failed` with the operation's own error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.try_acquire() else {
            tracing::debug!(breaker = %self.key, "Call rejected, circuit open");
            return Err(BreakerError::CircuitOpen {
                key: self.key.clone(),
            });
        };

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result.map_err(BreakerError::Failed),
                Err(_) => Err(BreakerError::Timeout(limit)),
            },
            None => operation().await.map_err(BreakerError::Failed),
        };

        permit.settle(outcome.is_ok());
        outcome
    }

    fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(CallPermit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if elapsed {
                    inner.transition(&self.key, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Some(CallPermit::new(self, true))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(CallPermit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.transition(&self.key, CircuitState::Closed);
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.transition(&self.key, CircuitState::Open);
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.transition(&self.key, CircuitState::Open);
            }
        }
    }
}

/// Outcome recorder for one admitted call.
///
/// A trial permit dropped without being settled (the caller's future was
/// cancelled) is recorded as a failure.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            tracing::warn!(breaker = %self.breaker.key, "Trial call cancelled");
            self.breaker.on_failure(true);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                call_timeout: None,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let result = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert!(matches!(result, Err(BreakerError::Failed("boom"))));
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_through() {
        let breaker = breaker(3, 1000);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let value = breaker.execute(|| async { Ok::<_, String>(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_not_before() {
        let breaker = breaker(3, 1000);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 1000);

        fail(&breaker).await;
        fail(&breaker).await;
        breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.consecutive_failures(), 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_operation() {
        let breaker = breaker(1, 10_000);
        fail(&breaker).await;

        let calls = AtomicUsize::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(1, 30);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 30);
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // timeout restarted
        let result = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(breaker(1, 30));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async move {
                    let _ = rx.await;
                    Ok::<_, String>("trial")
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let concurrent = breaker.execute(|| async { Ok::<_, String>("other") }).await;
        assert!(concurrent.unwrap_err().is_circuit_open());

        tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_counts_as_failure() {
        let breaker = Arc::new(breaker(1, 30));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| std::future::pending::<Result<(), String>>())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        trial.abort();
        assert!(trial.await.unwrap_err().is_cancelled());

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(10),
                call_timeout: Some(Duration::from_millis(20)),
            },
        );

        let result = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = breaker(1, 10_000);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
    }
}
