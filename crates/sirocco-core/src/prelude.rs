//! Curated re-exports for application code.

pub use crate::breaker::{BreakerConfig, BreakerMiddleware, BreakerRegistry, CircuitBreaker};
pub use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadMiddleware};
pub use crate::config::ServerConfig;
pub use crate::cors::Cors;
pub use crate::error::{Error, Result};
pub use crate::extract::{Form, FromRequest, Json, Query};
pub use crate::http::{Body, HeaderMap, Method, RequestContext, Response};
pub use crate::limit::RateLimiter;
pub use crate::logging::{init_logging, init_logging_json, init_logging_with_level};
pub use crate::pipeline::{Handler, Middleware, Next, from_fn};
pub use crate::router::Router;
pub use crate::security::SecurityHeaders;
pub use crate::server::{Server, ServerHandle};
pub use crate::session::{Session, SessionMiddleware, SessionStore};
pub use crate::sse::SseEvent;
pub use crate::trace::RequestTrace;
pub use crate::ws::{WsMessage, WsSession};
