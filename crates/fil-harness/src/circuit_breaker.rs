//! Consecutive-failure circuit breaker for background effect paths
//! (notably the auto-bug-filing path of the motivation engine).

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit is open – refusing call")]
    Open,
    #[error("inner error: {0}")]
    Inner(String),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many consecutive failures – calls fail fast.
    Open,
    /// Cooldown elapsed – one probe call is allowed through.
    HalfOpen,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before half-opening.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Execute `f` through the breaker.
    ///
    /// While **Open** and inside the cooldown the call is rejected without
    /// invoking `f`. Once the cooldown elapses the breaker half-opens and
    /// lets one probe through; a single success closes it, a failure
    /// re-opens it.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        {
            let mut guard = self.inner.lock().await;
            if guard.state == CircuitState::Open {
                let elapsed = guard.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    info!("circuit breaker transitioning Open -> HalfOpen");
                    guard.state = CircuitState::HalfOpen;
                } else {
                    return Err(CircuitBreakerError::Open);
                }
            }
        }

        match f().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(CircuitBreakerError::Inner(e.to_string()))
            }
        }
    }

    async fn record_success(&self) {
        let mut guard = self.inner.lock().await;
        if guard.state == CircuitState::HalfOpen {
            info!("circuit breaker transitioning HalfOpen -> Closed");
        }
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
    }

    async fn record_failure(&self) {
        let mut guard = self.inner.lock().await;
        guard.consecutive_failures += 1;
        match guard.state {
            CircuitState::Closed => {
                if guard.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = guard.consecutive_failures,
                        "circuit breaker transitioning Closed -> Open"
                    );
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker transitioning HalfOpen -> Open (probe failed)");
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    /// Manually reset to **Closed**.
    pub async fn reset(&self) {
        let mut guard = self.inner.lock().await;
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = breaker(3, 60_000);
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state().await, CircuitState::Closed);
        fail(&b).await;
        assert_eq!(b.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_fails_fast_without_invoking() {
        let b = breaker(1, 60_000);
        fail(&b).await;

        let mut invoked = false;
        let result = b
            .call(|| {
                invoked = true;
                async { Ok::<_, String>(1) }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let b = breaker(3, 60_000);
        fail(&b).await;
        fail(&b).await;
        b.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        fail(&b).await;
        fail(&b).await;
        // Streak restarted: still closed after two failures.
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let b = breaker(1, 10);
        fail(&b).await;
        assert_eq!(b.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let value = b.call(|| async { Ok::<_, String>(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let b = breaker(1, 10);
        fail(&b).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        fail(&b).await;
        assert_eq!(b.state().await, CircuitState::Open);
        // And the fresh cooldown applies again.
        let result = b.call(|| async { Ok::<_, String>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn manual_reset_closes() {
        let b = breaker(1, 60_000);
        fail(&b).await;
        b.reset().await;
        assert_eq!(b.state().await, CircuitState::Closed);
        b.call(|| async { Ok::<_, String>(()) }).await.unwrap();
    }
}
