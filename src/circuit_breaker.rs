//! Failure isolation for the payment provider.
//!
//! After `failure_threshold` consecutive failures the breaker opens and calls
//! fail immediately. Once `open_for` has passed, the next call is let through
//! as a trial call while every other call is still rejected: success closes the
//! breaker, failure opens it again. A trial call that is dropped before finishing
//! frees the slot for the next caller.

use metrics::{counter, gauge};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Frees the half-open trial slot if the trial call future is dropped early.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    open_for: Duration,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    #[error("circuit is open")]
    CircuitOpen,
    #[error(transparent)]
    Inner(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, open_for: Duration) -> Self {
        gauge!("circuit_breaker_state", CircuitState::Closed.gauge_value(), "service" => name);
        Self {
            name,
            failure_threshold: failure_threshold.max(1),
            open_for,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            })),
        }
    }

    /// Runs `f` unless the circuit is open. Every `Err` from `f` counts as a failure.
    pub async fn call<F, Fut, R, E>(&self, f: F) -> Result<R, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let Some(trial) = self.admit() else {
            counter!("circuit_breaker_rejections_total", 1, "service" => self.name);
            return Err(CircuitBreakerError::CircuitOpen);
        };

        let mut slot = TrialSlot {
            breaker: self,
            held: trial,
        };
        let result = f().await;
        self.record(result.is_ok(), trial);
        slot.held = false;
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, inner: &mut Inner, next: CircuitState) {
        if inner.state != next {
            info!(service = self.name, from = ?inner.state, to = ?next, "Circuit breaker state change");
            gauge!("circuit_breaker_state", next.gauge_value(), "service" => self.name);
            inner.state = next;
        }
    }

    /// `None` rejects the call, `Some(true)` admits it as the trial call.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(true)
            }
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.open_for);
                if !cooled_down {
                    return None;
                }
                self.set_state(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Some(true)
            }
        }
    }

    fn record(&self, success: bool, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        if success {
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            self.set_state(&mut inner, CircuitState::Closed);
            return;
        }

        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip {
            if inner.state == CircuitState::Closed {
                warn!(
                    service = self.name,
                    failures = inner.consecutive_failures,
                    "Opening circuit breaker"
                );
            }
            inner.opened_at = Some(Instant::now());
            self.set_state(&mut inner, CircuitState::Open);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    async fn ok(cb: &CircuitBreaker) -> Result<i32, CircuitBreakerError<&'static str>> {
        cb.call(|| async { Ok::<_, &'static str>(42) }).await
    }

    async fn fail(cb: &CircuitBreaker) -> Result<i32, CircuitBreakerError<&'static str>> {
        cb.call(|| async { Err::<i32, _>("boom") }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_secs(60));

        assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Inner("boom"))));
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(matches!(ok(&cb).await, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_secs(60));
        let _ = fail(&cb).await;
        assert_eq!(ok(&cb).await.unwrap(), 42);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn trial_after_cool_down_closes_or_reopens() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ok(&cb).await.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_trial_call() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let trial = {
            let cb = cb.clone();
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                cb.call(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<_, &'static str>(1)
                })
                .await
            })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = cb
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &'static str>(2) }
            })
            .await;
        assert!(matches!(second, Err(CircuitBreakerError::CircuitOpen)));

        release.notify_one();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_trial_call_frees_the_slot() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stuck = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<Result<i32, &'static str>>()),
        )
        .await;
        assert!(stuck.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(ok(&cb).await.unwrap(), 42);
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
