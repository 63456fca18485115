//! Circuit breaker: a closed / open / half-open state machine guarding one
//! upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that trip the breaker.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// How long the breaker stays open before admitting a probe.
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
    /// Wall-clock deadline enforced around each wrapped call; a timeout
    /// counts as a failure.
    pub request_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            request_timeout: None,
        }
    }
}

/// Running totals, exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerTotals {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
}

struct Inner {
    state: CircuitState,
    failure_timestamps: Vec<u64>,
    half_open_successes: u32,
    next_attempt_at_ms: u64,
    totals: BreakerTotals,
}

/// The state machine itself. Time flows in as explicit epoch-millis so the
/// transitions are deterministic under test.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_timestamps: Vec::new(),
                half_open_successes: 0,
                next_attempt_at_ms: 0,
                totals: BreakerTotals::default(),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn totals(&self) -> BreakerTotals {
        self.inner.lock().totals
    }

    /// Admission check. In open state the first caller at or past
    /// `next_attempt_at` flips to half-open and is admitted; half-open admits
    /// unconditionally (extra concurrent probes are counted like closed
    /// traffic).
    pub fn can_request(&self, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.totals.requests += 1;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now_ms >= inner.next_attempt_at_ms {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    true
                } else {
                    inner.totals.rejected += 1;
                    false
                }
            }
        }
    }

    /// Milliseconds until the next probe is admitted; 0 when not open.
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner.next_attempt_at_ms.saturating_sub(now_ms),
            _ => 0,
        }
    }

    pub fn record_success(&self, _now_ms: u64) {
        let mut inner = self.inner.lock();
        inner.totals.successes += 1;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failure_timestamps.clear();
                inner.half_open_successes = 0;
            }
        }
    }

    pub fn record_failure(&self, now_ms: u64) {
        let mut inner = self.inner.lock();
        inner.totals.failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                // Any half-open failure re-opens and restarts the timer.
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                inner.next_attempt_at_ms = now_ms + self.config.reset_timeout.as_millis() as u64;
            }
            CircuitState::Closed => {
                let window = self.config.failure_window.as_millis() as u64;
                let cutoff = now_ms.saturating_sub(window);
                inner.failure_timestamps.retain(|t| *t > cutoff);
                inner.failure_timestamps.push(now_ms);
                if inner.failure_timestamps.len() as u32 >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_attempt_at_ms =
                        now_ms + self.config.reset_timeout.as_millis() as u64;
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Named breakers as explicit handles. Callers share a registry through
/// configuration instead of a process-wide singleton.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }
}

type Classifier = Arc<dyn Fn(&Result<Response>) -> bool + Send + Sync>;
type Fallback = Arc<dyn Fn(u64) -> Response + Send + Sync>;

/// Middleware wrapping a handler with a shared breaker instance.
pub struct BreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
    /// Returns true when the outcome counts as a failure.
    classifier: Classifier,
    fallback: Option<Fallback>,
}

impl BreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker,
            classifier: Arc::new(|outcome| match outcome {
                Ok(res) => res.status >= 500,
                Err(_) => true,
            }),
            fallback: None,
        }
    }

    /// Override the failure classifier.
    pub fn classify<F>(mut self, f: F) -> Self
    where
        F: Fn(&Result<Response>) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(f);
        self
    }

    /// Response returned while the breaker rejects; receives the suggested
    /// retry-after in seconds.
    pub fn fallback<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Response + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(f));
        self
    }
}

impl Middleware for BreakerMiddleware {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let breaker = self.breaker.clone();
        let classifier = self.classifier.clone();
        let fallback = self.fallback.clone();
        Arc::new(move |ctx: RequestContext| {
            let breaker = breaker.clone();
            let classifier = classifier.clone();
            let fallback = fallback.clone();
            let inner = inner.clone();
            async move {
                let now_ms = epoch_ms();
                if !breaker.can_request(now_ms) {
                    let retry_after =
                        (breaker.retry_after_ms(now_ms).div_ceil(1000)).max(1);
                    let res = match &fallback {
                        Some(f) => f(retry_after),
                        None => Response::text(503, "Service Unavailable")
                            .header("retry-after", retry_after.to_string()),
                    };
                    return Ok(res);
                }

                let outcome = match breaker.config().request_timeout {
                    Some(deadline) => match tokio::time::timeout(deadline, inner.call(ctx)).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::Timeout),
                    },
                    None => inner.call(ctx).await,
                };

                let now_ms = epoch_ms();
                if classifier(&outcome) {
                    breaker.record_failure(now_ms);
                } else {
                    breaker.record_success(now_ms);
                }

                match outcome {
                    Err(Error::Timeout) => Ok(Response::gateway_timeout()),
                    other => other,
                }
            }
        })
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
