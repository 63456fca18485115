//! Handler and middleware composition.
//!
//! A middleware transforms a handler into a new handler. For a stack
//! `[m1, m2, m3]` and leaf `h` the effective handler is `m1(m2(m3(h)))`, so
//! `m1` runs outermost. Composition happens once when the route table is
//! compiled; requests invoke the cached composed handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::http::{RequestContext, Response};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'static>>;

/// A request handler: produces a response from a request context.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext) -> HandlerFuture;
}

pub type ArcHandler = Arc<dyn Handler>;

impl<F, Fut> Handler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

/// A handler transformer. Implementations capture their configuration and
/// return a wrapped handler; per-request work happens inside the returned
/// handler, not in `wrap`.
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, inner: ArcHandler) -> ArcHandler;
}

/// Right-associative composition: the first middleware in `stack` ends up
/// outermost.
pub fn compose(stack: &[Arc<dyn Middleware>], leaf: ArcHandler) -> ArcHandler {
    stack.iter().rev().fold(leaf, |inner, mw| mw.wrap(inner))
}

/// Continuation passed to `from_fn` middleware.
pub struct Next {
    inner: ArcHandler,
}

impl Next {
    pub fn new(inner: ArcHandler) -> Self {
        Self { inner }
    }

    pub async fn run(self, ctx: RequestContext) -> Result<Response> {
        self.inner.call(ctx).await
    }
}

/// Adapt an async closure `(ctx, next) -> response` into a [`Middleware`].
pub fn from_fn<F, Fut>(f: F) -> FnMiddleware<F>
where
    F: Fn(RequestContext, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    FnMiddleware { f: Arc::new(f) }
}

pub struct FnMiddleware<F> {
    f: Arc<F>,
}

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(RequestContext, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    fn wrap(&self, inner: ArcHandler) -> ArcHandler {
        let f = self.f.clone();
        Arc::new(move |ctx: RequestContext| {
            let next = Next::new(inner.clone());
            (f)(ctx, next)
        })
    }
}

/// Optional hook run before the composed handler; binds application state
/// into the request context.
pub type ContextProvider = Arc<
    dyn Fn(RequestContext) -> Pin<Box<dyn Future<Output = Result<RequestContext>> + Send + 'static>>
        + Send
        + Sync,
>;

/// Build a [`ContextProvider`] from an async closure.
pub fn context_provider<F, Fut>(f: F) -> ContextProvider
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RequestContext>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Invoke a composed handler, converting every failure mode into a response.
///
/// Uncaught handler errors become a minimal `500` (or whatever status the
/// error maps to) and are reported through tracing. With the `catch-panic`
/// feature, handler panics are caught here and treated identically.
pub async fn invoke(handler: &ArcHandler, provider: Option<&ContextProvider>, ctx: RequestContext) -> Response {
    let ctx = match provider {
        Some(p) => match p(ctx).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("context provider failed: {e}");
                return error_response(&e);
            }
        },
        None => ctx,
    };

    #[cfg(feature = "catch-panic")]
    {
        use futures_util::FutureExt;
        let fut = std::panic::AssertUnwindSafe(handler.call(ctx));
        return match fut.catch_unwind().await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => {
                tracing::error!("handler error: {e}");
                error_response(&e)
            }
            Err(panic) => {
                let msg = panic_message(&panic);
                tracing::error!("handler panicked: {msg}");
                Response::internal_error()
            }
        };
    }

    #[cfg(not(feature = "catch-panic"))]
    match handler.call(ctx).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!("handler error: {e}");
            error_response(&e)
        }
    }
}

fn error_response(e: &crate::error::Error) -> Response {
    let status = e.status_code();
    Response::text(status, crate::http::status_text(status))
}

#[cfg(feature = "catch-panic")]
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
