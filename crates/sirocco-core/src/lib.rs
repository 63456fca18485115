//! Sirocco core: an HTTP(S) engine built around one pipeline — accept a
//! connection, parse the request, match a route, run the middleware chain,
//! emit the response — plus the protection middleware (rate limiting,
//! circuit breaking, bulkheads, sessions) and the streaming surfaces
//! (chunked bodies, Server-Sent Events, WebSocket) that production traffic
//! needs.
//!
//! ```no_run
//! use sirocco_core::prelude::*;
//!
//! fn main() -> sirocco_core::Result<()> {
//!     init_logging();
//!     let mut router = Router::new();
//!     router.get("/users/:id", |ctx: RequestContext| async move {
//!         let id = ctx.param("id").unwrap_or("?").to_string();
//!         Ok(Response::ok(format!("user {id}")))
//!     });
//!     Server::bind("0.0.0.0:8080").serve(router)
//! }
//! ```

pub mod breaker;
pub mod bulkhead;
#[cfg(feature = "compression")]
pub mod compress;
pub mod config;
pub(crate) mod conn;
pub mod cookie;
pub mod cors;
pub mod error;
pub mod extract;
#[cfg(feature = "http2")]
pub(crate) mod h2c;
pub mod http;
pub mod limit;
pub mod logging;
pub mod metrics;
pub mod multipart;
pub mod parser;
pub mod pipeline;
pub mod prelude;
pub mod query;
pub mod router;
pub mod security;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod sse;
#[cfg(feature = "tls")]
pub mod tls;
pub mod trace;
pub(crate) mod worker;
pub mod ws;

// Re-exports for users
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use http::{Method, RequestContext, Response};
pub use logging::init_logging;
pub use pipeline::{Handler, Middleware, Next, from_fn};
pub use router::Router;
pub use server::{Server, ServerHandle};

#[cfg(feature = "perf")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
