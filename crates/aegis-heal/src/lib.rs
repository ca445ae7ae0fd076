//! Self-healing primitives: circuit breaker, deadlock-aware retry, and
//! network retry with jittered exponential backoff.
//!
//! Every component that touches the database or the network composes these
//! wrappers; nothing else in the control plane retries on its own.

#![forbid(unsafe_code)]

use aegis_metrics::MetricsRegistry;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ─── Circuit Breaker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: CLOSED 0, OPEN 1, HALF_OPEN 2.
    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker is OPEN; the call was rejected without executing.
    #[error("circuit breaker '{0}' is open")]
    Open(String),
    #[error("{0}")]
    Inner(E),
}

struct BreakerInner {
    state: BreakerState,
    failures: u32,
    probes: u32,
    last_change: Instant,
}

/// Three-state gate protecting an unreliable collaborator.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let name = name.into();
        metrics.set_gauge(
            &format!("circuit_breaker.{name}.state"),
            BreakerState::Closed.gauge_value(),
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                probes: 0,
                last_change: Instant::now(),
            }),
            metrics,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `f` through the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(name) = self.before_call() {
            return Err(BreakerError::Open(name));
        }
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Err carries the breaker name when the call must be rejected.
    fn before_call(&self) -> Result<(), String> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                if inner.last_change.elapsed() > self.config.reset_timeout {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    Ok(())
                } else {
                    Err(self.name.clone())
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.probes += 1;
                if inner.probes >= self.config.half_open_probes {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.metrics
            .increment(&format!("circuit_breaker.{}.failures_total", self.name));
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        warn!(breaker = %self.name, from = ?inner.state, to = ?to, "circuit breaker transition");
        inner.state = to;
        inner.last_change = Instant::now();
        inner.failures = 0;
        inner.probes = 0;
        self.metrics
            .set_gauge(&format!("circuit_breaker.{}.state", self.name), to.gauge_value());
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Exponential delay for the n-th retry (1-based), capped. No jitter.
pub fn exponential_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20));
    exp.min(cap_ms)
}

fn backoff_with_jitter(attempt: u32, base_ms: u64, cap_ms: u64, jitter_ms: u64) -> Duration {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..jitter_ms)
    };
    Duration::from_millis(exponential_delay_ms(attempt, base_ms, cap_ms) + jitter)
}

// ─── Deadlock retry ──────────────────────────────────────────────────────────

pub const DEADLOCK_MAX_ATTEMPTS: u32 = 5;
const DEADLOCK_BASE_MS: u64 = 50;
const DEADLOCK_CAP_MS: u64 = 2_000;
const DEADLOCK_JITTER_MS: u64 = 50;

/// True if the error text marks a transient store conflict: deadlock,
/// serialization failure, or lock timeout (including the common SQLSTATE /
/// MySQL codes).
pub fn is_transient_conflict(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("deadlock")
        || m.contains("serialization failure")
        || m.contains("could not serialize")
        || m.contains("lock timeout")
        || m.contains("lock wait timeout")
        || m.contains("40001")
        || m.contains("40p01")
        || m.contains("1213")
}

/// Retry `f` on transient store conflicts with jittered exponential backoff.
/// Any other failure propagates unchanged on the first occurrence.
pub async fn with_deadlock_retry<F, Fut, T, E>(metrics: &MetricsRegistry, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_transient_conflict(&e.to_string()) {
                    return Err(e);
                }
                if attempt >= DEADLOCK_MAX_ATTEMPTS {
                    metrics.increment("db.deadlock_retry.exhausted_total");
                    warn!(attempts = attempt, error = %e, "deadlock retries exhausted");
                    return Err(e);
                }
                metrics.increment("db.deadlock_retry.count");
                let delay =
                    backoff_with_jitter(attempt, DEADLOCK_BASE_MS, DEADLOCK_CAP_MS, DEADLOCK_JITTER_MS);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after store conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ─── Network retry ───────────────────────────────────────────────────────────

pub const NETWORK_MAX_ATTEMPTS: u32 = 4;
const NETWORK_BASE_MS: u64 = 200;
const NETWORK_CAP_MS: u64 = 5_000;
const NETWORK_JITTER_MS: u64 = 50;

/// True if the error text marks a transport-level failure.
pub fn is_transient_transport(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("connection refused")
        || m.contains("connection reset")
        || m.contains("timed out")
        || m.contains("timeout")
        || m.contains("broken pipe")
}

/// Retry `f` through `breaker` on transport failures. A breaker-open
/// rejection is returned immediately and never retried.
pub async fn with_network_retry<F, Fut, T, E>(
    breaker: &CircuitBreaker,
    metrics: &MetricsRegistry,
    f: F,
) -> Result<T, BreakerError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match breaker.call(&f).await {
            Ok(value) => return Ok(value),
            Err(BreakerError::Open(name)) => return Err(BreakerError::Open(name)),
            Err(BreakerError::Inner(e)) => {
                if !is_transient_transport(&e.to_string()) || attempt >= NETWORK_MAX_ATTEMPTS {
                    if attempt >= NETWORK_MAX_ATTEMPTS {
                        metrics.increment("net.retry.exhausted_total");
                    }
                    return Err(BreakerError::Inner(e));
                }
                metrics.increment("net.retry.count");
                let delay =
                    backoff_with_jitter(attempt, NETWORK_BASE_MS, NETWORK_CAP_MS, NETWORK_JITTER_MS);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after transport failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(config: BreakerConfig) -> (Arc<MetricsRegistry>, CircuitBreaker) {
        let metrics = Arc::new(MetricsRegistry::new());
        let cb = CircuitBreaker::new("test", config, metrics.clone());
        (metrics, cb)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold() {
        let (metrics, cb) = breaker(BreakerConfig::default());
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(metrics.gauge("circuit_breaker.test.state"), 1.0);
        assert_eq!(metrics.counter("circuit_breaker.test.failures_total"), 5);

        // The very next call is rejected without executing.
        let called = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                called.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_then_closes() {
        let config = BreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(20),
            half_open_probes: 2,
        };
        let (metrics, cb) = breaker(config);
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(25)).await;

        // First call after the reset timeout runs in HALF_OPEN.
        cb.call(|| async { Ok::<_, &'static str>(()) })
            .await
            .expect("probe 1");
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(metrics.gauge("circuit_breaker.test.state"), 2.0);

        cb.call(|| async { Ok::<_, &'static str>(()) })
            .await
            .expect("probe 2");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(metrics.gauge("circuit_breaker.test.state"), 0.0);
    }

    #[tokio::test]
    async fn test_breaker_half_open_failure_reopens() {
        let config = BreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(10),
            half_open_probes: 2,
        };
        let (_metrics, cb) = breaker(config);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_breaker_success_resets_failure_count() {
        let (_metrics, cb) = breaker(BreakerConfig::default());
        for _ in 0..4 {
            let _ = fail(&cb).await;
        }
        cb.call(|| async { Ok::<_, &'static str>(()) })
            .await
            .expect("success");
        let _ = fail(&cb).await;
        // 4 failures, success, 1 failure: still below threshold.
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_exponential_delay_curve() {
        assert_eq!(exponential_delay_ms(1, 50, 2_000), 50);
        assert_eq!(exponential_delay_ms(2, 50, 2_000), 100);
        assert_eq!(exponential_delay_ms(3, 50, 2_000), 200);
        assert_eq!(exponential_delay_ms(5, 50, 2_000), 800);
        assert_eq!(exponential_delay_ms(7, 50, 2_000), 2_000); // capped
        assert_eq!(exponential_delay_ms(1, 200, 5_000), 200);
        assert_eq!(exponential_delay_ms(6, 200, 5_000), 5_000);
    }

    #[test]
    fn test_conflict_classification() {
        assert!(is_transient_conflict("ERROR: deadlock detected"));
        assert!(is_transient_conflict("could not serialize access"));
        assert!(is_transient_conflict("SQLSTATE 40001"));
        assert!(is_transient_conflict("Lock wait timeout exceeded; code 1213"));
        assert!(!is_transient_conflict("syntax error at or near SELECT"));
        assert!(!is_transient_conflict("unique constraint violated"));
    }

    #[test]
    fn test_transport_classification() {
        assert!(is_transient_transport("connection refused"));
        assert!(is_transient_transport("operation timed out"));
        assert!(is_transient_transport("Connection reset by peer"));
        assert!(!is_transient_transport("404 not found"));
    }

    #[tokio::test]
    async fn test_deadlock_retry_recovers() {
        let metrics = MetricsRegistry::new();
        let attempts = AtomicU32::new(0);
        let result = with_deadlock_retry(&metrics, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= 2 {
                Err("deadlock detected".to_string())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.expect("recovers"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.counter("db.deadlock_retry.count"), 2);
        assert_eq!(metrics.counter("db.deadlock_retry.exhausted_total"), 0);
    }

    #[tokio::test]
    async fn test_deadlock_retry_non_transient_propagates() {
        let metrics = MetricsRegistry::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = with_deadlock_retry(&metrics, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("constraint violation".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter("db.deadlock_retry.count"), 0);
    }

    #[tokio::test]
    async fn test_deadlock_retry_exhaustion() {
        let metrics = MetricsRegistry::new();
        let attempts = AtomicU32::new(0);
        let result: Result<(), String> = with_deadlock_retry(&metrics, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err("deadlock detected".to_string())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), DEADLOCK_MAX_ATTEMPTS);
        assert_eq!(metrics.counter("db.deadlock_retry.exhausted_total"), 1);
    }

    #[tokio::test]
    async fn test_network_retry_breaker_open_not_retried() {
        let metrics = Arc::new(MetricsRegistry::new());
        let cb = CircuitBreaker::new(
            "net",
            BreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            metrics.clone(),
        );
        // Trip the breaker.
        let _ = cb.call(|| async { Err::<(), _>("connection refused") }).await;
        assert_eq!(cb.state(), BreakerState::Open);

        let attempts = AtomicU32::new(0);
        let result = with_network_retry(&cb, &metrics, || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;

        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.counter("net.retry.count"), 0);
    }

    #[tokio::test]
    async fn test_network_retry_recovers() {
        let metrics = Arc::new(MetricsRegistry::new());
        let cb = CircuitBreaker::new("net2", BreakerConfig::default(), metrics.clone());
        let attempts = AtomicU32::new(0);
        let result = with_network_retry(&cb, &metrics, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 1 {
                Err("operation timed out".to_string())
            } else {
                Ok("payload")
            }
        })
        .await;

        assert_eq!(result.expect("recovers"), "payload");
        assert_eq!(metrics.counter("net.retry.count"), 1);
    }
}
