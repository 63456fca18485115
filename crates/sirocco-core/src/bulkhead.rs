//! Bulkhead: a counted semaphore with a bounded FIFO wait queue, isolating
//! a route (or upstream) behind a fixed concurrency budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::http::{RequestContext, Response};
use crate::pipeline::{ArcHandler, Middleware};

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    /// Per-entry deadline while waiting in the queue.
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 10,
            queue_timeout: Duration::from_secs(1),
        }
    }
}

/// Why an acquisition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `running == max_concurrent` and the queue is full.
    QueueFull,
    /// The waiter's deadline expired before a permit freed up.
    QueueTimeout,
}

/// Releases the slot on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self { config, semaphore, queued: AtomicUsize::new(0) }
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    pub fn running(&self) -> usize {
        self.config.max_concurrent - self.semaphore.available_permits().min(self.config.max_concurrent)
    }

    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Non-suspending acquisition: a permit when one is free, else `None`.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| BulkheadPermit { _permit: permit })
    }

    /// Acquire a permit, queueing (FIFO) when the budget is exhausted.
    ///
    /// A waiter appears in the queue only while `running == max_concurrent`;
    /// it is removed and rejected once `queue_timeout` elapses, and released
    /// from the queue count even if the caller is cancelled mid-wait.
    pub async fn acquire(&self) -> Result<BulkheadPermit, Rejection> {
        if let Some(permit) = self.try_acquire() {
            return Ok(permit);
        }

        // Reserve a queue slot or reject outright.
        let max_queue = self.config.max_queue;
        if self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                if q < max_queue { Some(q + 1) } else { None }
            })
            .is_err()
        {
            return Err(Rejection::QueueFull);
        }
        let _guard = QueueGuard { queued: &self.queued };

        match tokio::time::timeout(
            self.config.queue_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
            Ok(Err(_closed)) => Err(Rejection::QueueFull),
            Err(_elapsed) => Err(Rejection::QueueTimeout),
        }
    }
}

struct QueueGuard<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

type RejectFn = Arc<dyn Fn(Rejection) -> Response + Send + Sync>;

/// Middleware holding a bulkhead permit across the wrapped handler.
pub struct BulkheadMiddleware {
    bulkhead: Arc<Bulkhead>,
    on_reject: Option<RejectFn>,
}

impl BulkheadMiddleware {
    pub fn new(bulkhead: Arc<Bulkhead>) -> Self {
        Self { bulkhead, on_reject: None }
    }

    pub fn with_config(config: BulkheadConfig) -> Self {
        Self::new(Arc::new(Bulkhead::new(config)))
    }

    pub fn on_reject<F>(mut self, f: F) -> Self
    where
        F: Fn(Rejection) -> Response + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(f));
        self
    }
}

impl Middleware for BulkheadMiddleware {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let bulkhead = self.bulkhead.clone();
        let on_reject = self.on_reject.clone();
        Arc::new(move |ctx: RequestContext| {
            let bulkhead = bulkhead.clone();
            let on_reject = on_reject.clone();
            let inner = inner.clone();
            async move {
                match bulkhead.acquire().await {
                    Ok(permit) => {
                        let res = inner.call(ctx).await;
                        drop(permit);
                        res
                    }
                    Err(rejection) => {
                        let res = match &on_reject {
                            Some(f) => f(rejection),
                            None => Response::text(503, "Service Unavailable")
                                .header("retry-after", "5"),
                        };
                        Ok(res)
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulkhead(max_concurrent: usize, max_queue: usize, timeout_ms: u64) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(BulkheadConfig {
            max_concurrent,
            max_queue,
            queue_timeout: Duration::from_millis(timeout_ms),
        }))
    }

    #[tokio::test]
    async fn permits_bound_running() {
        let b = bulkhead(2, 0, 50);
        let p1 = b.acquire().await.unwrap();
        let p2 = b.acquire().await.unwrap();
        assert_eq!(b.running(), 2);
        // Queue capacity zero: immediate rejection.
        assert_eq!(b.acquire().await.unwrap_err(), Rejection::QueueFull);
        drop(p1);
        let _p3 = b.acquire().await.unwrap();
        assert_eq!(b.running(), 2);
        drop(p2);
        assert_eq!(b.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_admitted_when_permit_frees() {
        let b = bulkhead(1, 4, 1_000);
        let p = b.acquire().await.unwrap();

        let b2 = b.clone();
        let waiter = tokio::spawn(async move { b2.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.queue_len(), 1);

        drop(p);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
        assert_eq!(b.queue_len(), 0);
        assert_eq!(b.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_is_rejected() {
        let b = bulkhead(1, 4, 100);
        let _p = b.acquire().await.unwrap();

        let b2 = b.clone();
        let waiter = tokio::spawn(async move { b2.acquire().await });
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.unwrap_err(), Rejection::QueueTimeout);
        assert_eq!(b.queue_len(), 0);
        // The permit was never granted to the dead waiter.
        assert_eq!(b.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_capacity_is_bounded() {
        let b = bulkhead(1, 2, 10_000);
        let _p = b.acquire().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let b2 = b.clone();
            waiters.push(tokio::spawn(async move { b2.acquire().await }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(b.queue_len(), 2);

        // Third waiter finds the queue full.
        assert_eq!(b.acquire().await.unwrap_err(), Rejection::QueueFull);
        for w in waiters {
            w.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_wakeup_order() {
        let b = bulkhead(1, 4, 10_000);
        let p = b.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3u32 {
            let b2 = b.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let permit = b2.acquire().await.unwrap();
                tx.send(i).unwrap();
                drop(permit);
            });
            // Deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(p);
        let order: Vec<u32> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(order, [0, 1, 2]);
    }

    mod middleware {
        use super::*;
        use crate::http::Method;
        use crate::pipeline::Handler;

        #[tokio::test(start_paused = true)]
        async fn rejection_maps_to_503() {
            let b = bulkhead(1, 0, 10);
            let _held = b.acquire().await.unwrap();

            let handler: ArcHandler =
                Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("through")) });
            let wrapped = BulkheadMiddleware::new(b.clone()).wrap(handler);
            let res = wrapped.call(RequestContext::new(Method::Get, "/")).await.unwrap();
            assert_eq!(res.status, 503);
            assert_eq!(res.headers.get("retry-after"), Some("5"));
        }

        #[tokio::test]
        async fn permit_released_after_handler() {
            let b = bulkhead(1, 0, 10);
            let handler: ArcHandler =
                Arc::new(|_ctx: RequestContext| async { Ok(Response::ok("through")) });
            let wrapped = BulkheadMiddleware::new(b.clone()).wrap(handler);
            for _ in 0..5 {
                let res = wrapped.call(RequestContext::new(Method::Get, "/")).await.unwrap();
                assert_eq!(res.status, 200);
            }
            assert_eq!(b.running(), 0);
        }
    }
}
