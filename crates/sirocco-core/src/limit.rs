//! Rate limiting: fixed window, sliding window and token bucket over a
//! pluggable store.
//!
//! All three algorithms share the check-and-increment contract: one store
//! round trip that answers `{allowed, remaining, reset_at}`. The store is
//! authoritative; the middleware owns only the counting protocol and the
//! response headers.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{RateLimitAlgorithm, RateLimitConfig};
use crate::error::Result;
use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

/// Outcome of one check-and-increment round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch milliseconds at which the key's window resets (for the token
    /// bucket: when at least one token is available again).
    pub reset_at_ms: u64,
}

impl RateDecision {
    fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1)
    }
}

/// Pluggable counter backend. Implementations must apply each operation
/// atomically per key; a Redis-shaped store does this with a scripted
/// read-modify-write.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fixed window: reset the window when stale, deny at the limit without
    /// incrementing, else increment.
    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<RateDecision>;

    /// Sliding window: prune timestamps older than the window, deny when the
    /// survivor count reaches the limit, else append `now`.
    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<RateDecision>;

    /// Token bucket: refill by elapsed time, deny when the balance cannot
    /// cover `cost`, else subtract.
    async fn token_bucket(
        &self,
        key: &str,
        max: f64,
        refill_per_ms: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<RateDecision>;

    /// Read-only probe: `{count, reset_at}` for a windowed key, if present.
    async fn get(&self, key: &str) -> Result<Option<(u64, u64)>>;

    /// Evict entries that can no longer influence a decision. Distributed
    /// backends with native TTLs keep the no-op default.
    fn sweep(&self, _now_ms: u64) {}
}

enum Entry {
    Window { count: u64, reset_at_ms: u64 },
    Timestamps(Vec<u64>),
    Bucket { tokens: f64, last_refill_ms: u64 },
}

const SHARDS: usize = 16;

/// Default in-memory backend: striped mutexes so different keys proceed in
/// parallel, plus a periodic sweep evicting expired entries.
pub struct MemoryRateLimitStore {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn fixed_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<RateDecision> {
        let mut shard = self.shard(key).lock();
        let entry = shard.entry(key.to_string()).or_insert(Entry::Window {
            count: 0,
            reset_at_ms: now_ms + window_ms,
        });
        if !matches!(entry, Entry::Window { .. }) {
            *entry = Entry::Window { count: 0, reset_at_ms: now_ms + window_ms };
        }
        let Entry::Window { count, reset_at_ms } = entry else {
            unreachable!()
        };

        if *reset_at_ms <= now_ms {
            *count = 0;
            *reset_at_ms = now_ms + window_ms;
        }
        if *count >= limit {
            return Ok(RateDecision { allowed: false, remaining: 0, reset_at_ms: *reset_at_ms });
        }
        *count += 1;
        Ok(RateDecision {
            allowed: true,
            remaining: limit - *count,
            reset_at_ms: *reset_at_ms,
        })
    }

    async fn sliding_window(
        &self,
        key: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
    ) -> Result<RateDecision> {
        let mut shard = self.shard(key).lock();
        let entry = shard
            .entry(key.to_string())
            .or_insert_with(|| Entry::Timestamps(Vec::new()));
        if !matches!(entry, Entry::Timestamps(_)) {
            *entry = Entry::Timestamps(Vec::new());
        }
        let Entry::Timestamps(ts) = entry else {
            unreachable!()
        };

        let cutoff = now_ms.saturating_sub(window_ms);
        ts.retain(|t| *t > cutoff);

        if ts.len() as u64 >= limit {
            let oldest = ts.first().copied().unwrap_or(now_ms);
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at_ms: oldest + window_ms,
            });
        }
        ts.push(now_ms);
        let oldest = ts.first().copied().unwrap_or(now_ms);
        Ok(RateDecision {
            allowed: true,
            remaining: limit - ts.len() as u64,
            reset_at_ms: oldest + window_ms,
        })
    }

    async fn token_bucket(
        &self,
        key: &str,
        max: f64,
        refill_per_ms: f64,
        cost: f64,
        now_ms: u64,
    ) -> Result<RateDecision> {
        let mut shard = self.shard(key).lock();
        let entry = shard.entry(key.to_string()).or_insert(Entry::Bucket {
            tokens: max,
            last_refill_ms: now_ms,
        });
        if !matches!(entry, Entry::Bucket { .. }) {
            *entry = Entry::Bucket { tokens: max, last_refill_ms: now_ms };
        }
        let Entry::Bucket { tokens, last_refill_ms } = entry else {
            unreachable!()
        };

        let elapsed = now_ms.saturating_sub(*last_refill_ms) as f64;
        *tokens = (*tokens + elapsed * refill_per_ms).min(max);
        *last_refill_ms = now_ms;

        let next_token_at = |tokens: f64| {
            if tokens >= 1.0 || refill_per_ms <= 0.0 {
                now_ms
            } else {
                now_ms + ((1.0 - tokens) / refill_per_ms).ceil() as u64
            }
        };

        if *tokens < cost {
            return Ok(RateDecision {
                allowed: false,
                remaining: tokens.floor() as u64,
                reset_at_ms: next_token_at(*tokens),
            });
        }
        *tokens -= cost;
        Ok(RateDecision {
            allowed: true,
            remaining: tokens.floor() as u64,
            reset_at_ms: next_token_at(*tokens),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<(u64, u64)>> {
        let shard = self.shard(key).lock();
        Ok(match shard.get(key) {
            Some(Entry::Window { count, reset_at_ms }) => Some((*count, *reset_at_ms)),
            Some(Entry::Timestamps(ts)) => {
                Some((ts.len() as u64, ts.first().copied().unwrap_or(0)))
            }
            _ => None,
        })
    }

    /// One short exclusive lock per shard.
    fn sweep(&self, now_ms: u64) {
        for shard in &self.shards {
            shard.lock().retain(|_, entry| match entry {
                Entry::Window { reset_at_ms, .. } => *reset_at_ms > now_ms,
                Entry::Timestamps(ts) => ts.last().is_some_and(|t| *t + 3_600_000 > now_ms),
                Entry::Bucket { last_refill_ms, .. } => *last_refill_ms + 3_600_000 > now_ms,
            });
        }
    }
}

type KeyFn = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;
type SkipFn = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;
type DenyFn = Arc<dyn Fn(&RateDecision) -> Response + Send + Sync>;

/// Rate-limiting middleware.
pub struct RateLimiter {
    algorithm: RateLimitAlgorithm,
    max: u64,
    window_ms: u64,
    refill_per_ms: f64,
    emit_headers: bool,
    store: Arc<dyn RateLimitStore>,
    key_fn: KeyFn,
    skip: Option<SkipFn>,
    on_deny: Option<DenyFn>,
    sweeper: Arc<std::sync::OnceLock<()>>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let refill_per_ms = cfg
            .refill_per_sec
            .map(|r| r / 1000.0)
            .unwrap_or(cfg.max as f64 / cfg.window_ms as f64);
        Self {
            algorithm: cfg.algorithm,
            max: cfg.max,
            window_ms: cfg.window_ms,
            refill_per_ms,
            emit_headers: cfg.headers,
            store: Arc::new(MemoryRateLimitStore::new()),
            key_fn: Arc::new(|ctx| ctx.client_ip().unwrap_or_else(|| "unknown".to_string())),
            skip: None,
            on_deny: None,
            sweeper: Arc::new(std::sync::OnceLock::new()),
        }
    }

    /// Start the periodic store sweep once, on the first serving runtime.
    fn start_sweeper(&self) {
        self.sweeper.get_or_init(|| {
            let store = self.store.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    store.sweep(epoch_ms());
                }
            });
        });
    }

    /// Swap in a distributed backend.
    pub fn store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = store;
        self
    }

    /// Custom key strategy (API key, tenant id, ...).
    pub fn key_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    /// Short-circuit predicate; matching requests pass through without
    /// counting.
    pub fn skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(f));
        self
    }

    /// Override the denial response.
    pub fn on_deny<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateDecision) -> Response + Send + Sync + 'static,
    {
        self.on_deny = Some(Arc::new(f));
        self
    }

    /// One check-and-increment round trip for `key`.
    pub async fn check(&self, key: &str, now_ms: u64) -> Result<RateDecision> {
        match self.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                self.store.fixed_window(key, self.max, self.window_ms, now_ms).await
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.store.sliding_window(key, self.max, self.window_ms, now_ms).await
            }
            RateLimitAlgorithm::TokenBucket => {
                self.store
                    .token_bucket(key, self.max as f64, self.refill_per_ms, 1.0, now_ms)
                    .await
            }
        }
    }

    fn apply_headers(&self, mut res: Response, decision: &RateDecision) -> Response {
        if self.emit_headers {
            res.headers.set("x-ratelimit-limit", self.max.to_string());
            res.headers.set("x-ratelimit-remaining", decision.remaining.to_string());
            res.headers
                .set("x-ratelimit-reset", (decision.reset_at_ms / 1000).to_string());
        }
        res
    }
}

impl Middleware for RateLimiter {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let limiter = Arc::new(Self {
            algorithm: self.algorithm,
            max: self.max,
            window_ms: self.window_ms,
            refill_per_ms: self.refill_per_ms,
            emit_headers: self.emit_headers,
            store: self.store.clone(),
            key_fn: self.key_fn.clone(),
            skip: self.skip.clone(),
            on_deny: self.on_deny.clone(),
            sweeper: self.sweeper.clone(),
        });
        Arc::new(move |ctx: RequestContext| {
            let limiter = limiter.clone();
            let inner = inner.clone();
            async move {
                limiter.start_sweeper();
                if let Some(skip) = &limiter.skip
                    && skip(&ctx)
                {
                    return inner.call(ctx).await;
                }

                let key = (limiter.key_fn)(&ctx);
                let now_ms = epoch_ms();
                let decision = match limiter.check(&key, now_ms).await {
                    Ok(d) => d,
                    Err(e) => {
                        // A broken store must not take the service down with
                        // it; the request proceeds uncounted.
                        tracing::warn!("rate limit store failed for {key:?}: {e}");
                        return inner.call(ctx).await;
                    }
                };

                if !decision.allowed {
                    let res = match &limiter.on_deny {
                        Some(f) => f(&decision),
                        None => Response::text(429, "Too Many Requests"),
                    };
                    let res = res.header("retry-after", decision.retry_after_secs(now_ms).to_string());
                    return Ok(limiter.apply_headers(res, &decision));
                }

                let res = inner.call(ctx).await?;
                Ok(limiter.apply_headers(res, &decision))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryRateLimitStore {
        MemoryRateLimitStore::new()
    }

    #[tokio::test]
    async fn fixed_window_counts_down_then_denies() {
        let s = store();
        let t0 = 1_000_000;
        let d1 = s.fixed_window("k", 2, 60_000, t0).await.unwrap();
        let d2 = s.fixed_window("k", 2, 60_000, t0 + 10).await.unwrap();
        let d3 = s.fixed_window("k", 2, 60_000, t0 + 20).await.unwrap();
        assert!(d1.allowed && d2.allowed && !d3.allowed);
        // Remaining strictly decreases across allowed requests.
        assert_eq!(d1.remaining, 1);
        assert_eq!(d2.remaining, 0);
        assert_eq!(d3.remaining, 0);
        assert_eq!(d3.reset_at_ms, t0 + 60_000);

        // Denials do not consume the next window.
        let d4 = s.fixed_window("k", 2, 60_000, t0 + 60_000).await.unwrap();
        assert!(d4.allowed);
        assert_eq!(d4.remaining, 1);
    }

    #[tokio::test]
    async fn fixed_window_keys_are_independent() {
        let s = store();
        let t0 = 5_000;
        assert!(s.fixed_window("a", 1, 1000, t0).await.unwrap().allowed);
        assert!(!s.fixed_window("a", 1, 1000, t0).await.unwrap().allowed);
        assert!(s.fixed_window("b", 1, 1000, t0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn sliding_window_reopens_after_oldest_expires() {
        let s = store();
        let t0 = 100_000;
        let window = 10_000;
        for i in 0..3u64 {
            let d = s.sliding_window("k", 3, window, t0 + i * 100).await.unwrap();
            assert!(d.allowed, "request {i} should pass");
        }
        let denied = s.sliding_window("k", 3, window, t0 + 500).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at_ms, t0 + window);

        // Just before t0 + window the oldest timestamp still counts.
        assert!(!s.sliding_window("k", 3, window, t0 + window - 1).await.unwrap().allowed);
        // At exactly t0 + window the first slot has aged out.
        assert!(s.sliding_window("k", 3, window, t0 + window + 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let s = store();
        let t0 = 50_000;
        // 2 tokens max, 1 token per second.
        let refill = 1.0 / 1000.0;
        assert!(s.token_bucket("k", 2.0, refill, 1.0, t0).await.unwrap().allowed);
        assert!(s.token_bucket("k", 2.0, refill, 1.0, t0).await.unwrap().allowed);
        let d = s.token_bucket("k", 2.0, refill, 1.0, t0).await.unwrap();
        assert!(!d.allowed);
        assert!(d.reset_at_ms > t0);

        // One second later a single token is back.
        assert!(s.token_bucket("k", 2.0, refill, 1.0, t0 + 1000).await.unwrap().allowed);
        assert!(!s.token_bucket("k", 2.0, refill, 1.0, t0 + 1000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn token_bucket_caps_at_max() {
        let s = store();
        let refill = 1.0 / 1000.0;
        let t0 = 1_000;
        assert!(s.token_bucket("k", 2.0, refill, 1.0, t0).await.unwrap().allowed);
        // A long idle period refills to max, not beyond.
        let d = s.token_bucket("k", 2.0, refill, 1.0, t0 + 3_600_000).await.unwrap();
        assert_eq!(d.remaining, 1); // 2 tokens refilled, 1 spent
    }

    #[tokio::test]
    async fn sweep_evicts_dead_windows() {
        let s = store();
        let t0 = 10_000;
        s.fixed_window("gone", 5, 1_000, t0).await.unwrap();
        s.fixed_window("live", 5, 1_000_000, t0).await.unwrap();
        s.sweep(t0 + 10_000);
        assert!(s.get("gone").await.unwrap().is_none());
        assert!(s.get("live").await.unwrap().is_some());
    }

    mod middleware {
        use super::*;
        use crate::http::Method;
        use crate::pipeline::Handler;

        fn ok_handler() -> ArcHandler {
            Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("hi")) })
        }

        fn request() -> RequestContext {
            let mut ctx = RequestContext::new(Method::Get, "/");
            ctx.peer_addr = Some("127.0.0.1:9999".parse().unwrap());
            ctx
        }

        fn limiter(max: u64) -> RateLimiter {
            RateLimiter::new(&RateLimitConfig {
                algorithm: RateLimitAlgorithm::FixedWindow,
                max,
                window_ms: 60_000,
                refill_per_sec: None,
                headers: true,
            })
        }

        #[tokio::test]
        async fn three_requests_two_allowed() {
            let wrapped = limiter(2).wrap(ok_handler());
            let r1 = wrapped.call(request()).await.unwrap();
            let r2 = wrapped.call(request()).await.unwrap();
            let r3 = wrapped.call(request()).await.unwrap();
            assert_eq!((r1.status, r2.status, r3.status), (200, 200, 429));
            assert_eq!(r3.headers.get("x-ratelimit-remaining"), Some("0"));
            assert!(r3.headers.get("retry-after").is_some());
            // Allowed responses carry the headers too.
            assert_eq!(r1.headers.get("x-ratelimit-limit"), Some("2"));
            assert_eq!(r1.headers.get("x-ratelimit-remaining"), Some("1"));
        }

        #[tokio::test]
        async fn skip_predicate_bypasses_counting() {
            let wrapped = limiter(1)
                .skip(|ctx| ctx.path == "/health")
                .wrap(ok_handler());

            for _ in 0..5 {
                let mut ctx = request();
                ctx.path = "/health".to_string();
                let res = wrapped.call(ctx).await.unwrap();
                assert_eq!(res.status, 200);
                assert!(res.headers.get("x-ratelimit-limit").is_none());
            }
            // The budget is still untouched.
            assert_eq!(wrapped.call(request()).await.unwrap().status, 200);
        }

        #[tokio::test]
        async fn custom_key_and_deny_response() {
            let wrapped = limiter(1)
                .key_extractor(|ctx| ctx.header("x-api-key").unwrap_or("anon").to_string())
                .on_deny(|_| Response::text(429, "slow down"))
                .wrap(ok_handler());

            let mut a = request();
            a.headers.set("x-api-key", "alpha");
            let mut b = request();
            b.headers.set("x-api-key", "beta");
            assert_eq!(wrapped.call(a).await.unwrap().status, 200);
            assert_eq!(wrapped.call(b).await.unwrap().status, 200);

            let mut a2 = request();
            a2.headers.set("x-api-key", "alpha");
            let denied = wrapped.call(a2).await.unwrap();
            assert_eq!(denied.status, 429);
            assert_eq!(denied.body.as_bytes(), b"slow down");
        }
    }
}
