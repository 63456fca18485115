//! Server assembly: configuration, listener setup, worker spawning and the
//! running-server handle.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::pipeline::ContextProvider;
use crate::router::{RouteTable, Router};
use crate::shutdown::ShutdownState;
use crate::worker;

/// Shared engine state: everything a worker needs to serve traffic.
pub(crate) struct Engine {
    pub(crate) config: Arc<ServerConfig>,
    /// Read-mostly, single writer. Readers clone the Arc; hot reload swaps
    /// the whole table atomically.
    table: RwLock<Arc<RouteTable>>,
    pub(crate) provider: Option<ContextProvider>,
    pub(crate) shutdown: Arc<ShutdownState>,
    /// Configuration-driven middleware, wrapped outside every route's
    /// stack. Kept so hot reloads compose the same way the initial table
    /// did.
    config_middleware: Vec<Arc<dyn crate::pipeline::Middleware>>,
}

impl Engine {
    pub(crate) fn table(&self) -> Arc<RouteTable> {
        self.table.read().clone()
    }

    pub(crate) fn install(&self, table: RouteTable) {
        *self.table.write() = Arc::new(table);
    }
}

/// Builder for a Sirocco server.
///
/// ```no_run
/// use sirocco_core::prelude::*;
///
/// fn main() -> sirocco_core::Result<()> {
///     init_logging();
///     let mut router = Router::new();
///     router.get("/hello", |_ctx: RequestContext| async { Ok(Response::ok("Hello, World!")) });
///     Server::bind("127.0.0.1:8080").workers(2).serve(router)
/// }
/// ```
pub struct Server {
    config: ServerConfig,
    provider: Option<ContextProvider>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, provider: None }
    }

    /// Configuration from defaults + environment overrides.
    pub fn from_env() -> Self {
        Self::new(ServerConfig::from_env())
    }

    /// Convenience constructor from a `host:port` string.
    pub fn bind(host_port: &str) -> Self {
        let mut config = ServerConfig::default();
        if let Some((host, port)) = host_port.rsplit_once(':') {
            if !host.is_empty() {
                config.hostname = host.to_string();
            }
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        Self::new(config)
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    /// Install a context provider: runs before the composed handler and
    /// binds application state into each request context.
    pub fn context<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(crate::http::RequestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<crate::http::RequestContext>> + Send + 'static,
    {
        self.provider = Some(crate::pipeline::context_provider(f));
        self
    }

    /// Compile the routes, bind the listeners and start the workers.
    pub fn start(mut self, router: Router) -> Result<ServerHandle> {
        self.config.apply_env();
        self.config.validate()?;
        if self.config.http2.enabled && !cfg!(feature = "http2") {
            return Err(Error::Config("built without the http2 feature".into()));
        }

        let config_middleware = middleware_from_config(&self.config);
        let table = router.compile_with(&config_middleware)?;
        let config = Arc::new(self.config);
        let shutdown = Arc::new(ShutdownState::new());
        let engine = Arc::new(Engine {
            config: config.clone(),
            table: RwLock::new(Arc::new(table)),
            provider: self.provider,
            shutdown: shutdown.clone(),
            config_middleware,
        });

        #[cfg(feature = "tls")]
        let tls: worker::TlsHandle = match &config.tls {
            Some(tls_cfg) => Some(crate::tls::acceptor(tls_cfg, config.http2.enabled)?),
            None => None,
        };
        #[cfg(not(feature = "tls"))]
        let tls: worker::TlsHandle = if config.tls.is_some() {
            return Err(Error::Config("built without the tls feature".into()));
        } else {
            None
        };

        let mut addr = resolve(&config.hostname, config.port)?;

        // The first bind resolves port 0 to a concrete port; the remaining
        // reuseport listeners share it.
        let first = build_listener(addr)?;
        let local_addr = first.local_addr()?;
        addr.set_port(local_addr.port());

        let mut listeners = vec![first];
        for _ in 1..config.workers {
            listeners.push(build_listener(addr)?);
        }

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut threads = Vec::with_capacity(listeners.len());
        for (i, listener) in listeners.into_iter().enumerate() {
            let core = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            threads.push(worker::spawn(i, listener, engine.clone(), tls.clone(), core)?);
        }

        tracing::info!(
            "sirocco serving on {} with {} workers (SO_REUSEPORT)",
            local_addr,
            config.workers
        );

        Ok(ServerHandle { engine, local_addr, threads })
    }

    /// Start and block until the server stops.
    pub fn serve(self, router: Router) -> Result<()> {
        let handle = self.start(router)?;
        handle.join();
        Ok(())
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    engine: Arc<Engine>,
    local_addr: SocketAddr,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address (with the real port when configured as 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.engine.shutdown.active_connections()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.engine.shutdown.is_shutting_down()
    }

    /// Atomically replace the route table. In-flight requests finish on the
    /// table they started with.
    pub fn reload(&self, router: &Router) -> Result<()> {
        let table = router.compile_with(&self.engine.config_middleware)?;
        self.engine.install(table);
        Ok(())
    }

    /// Graceful stop: drain in-flight work, force-close at the deadline.
    /// Returns true when every connection drained in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.engine.shutdown.drain(timeout).await
    }

    /// Blocking variant of [`stop`](Self::stop) for non-async callers.
    pub fn stop_blocking(&self, timeout: Duration) -> bool {
        match tokio::runtime::Builder::new_current_thread().enable_time().build() {
            Ok(rt) => rt.block_on(self.stop(timeout)),
            Err(e) => {
                tracing::error!("failed to build shutdown runtime: {e}");
                false
            }
        }
    }

    /// Block until every worker thread exits.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Middleware implied by the configuration surface, outermost first: rate
/// limiting denies before any other work, then security headers, CORS,
/// compression, sessions.
fn middleware_from_config(config: &ServerConfig) -> Vec<Arc<dyn crate::pipeline::Middleware>> {
    let mut stack: Vec<Arc<dyn crate::pipeline::Middleware>> = Vec::new();
    if let Some(rl) = &config.rate_limit {
        stack.push(Arc::new(crate::limit::RateLimiter::new(rl)));
    }
    if let Some(security) = &config.security {
        stack.push(Arc::new(crate::security::SecurityHeaders::new(security.clone())));
    }
    if let Some(cors) = &config.cors {
        stack.push(Arc::new(crate::cors::Cors::new(cors.clone())));
    }
    #[cfg(feature = "compression")]
    if let Some(compression) = &config.compression {
        stack.push(Arc::new(crate::compress::Compression::new(compression.clone())));
    }
    #[cfg(not(feature = "compression"))]
    if config.compression.is_some() {
        tracing::warn!("compression configured but built without the compression feature");
    }
    if let Some(session) = &config.session {
        stack.push(Arc::new(crate::session::SessionMiddleware::new(session.clone())));
    }
    stack
}

fn resolve(hostname: &str, port: u16) -> Result<SocketAddr> {
    (hostname, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {hostname}:{port}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("{hostname}:{port} resolved to no addresses")))
}

fn build_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(8192)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RequestContext, Response};

    #[test]
    fn bind_parses_host_port() {
        let server = Server::bind("127.0.0.1:9123");
        assert_eq!(server.config().hostname, "127.0.0.1");
        assert_eq!(server.config().port, 9123);

        let server = Server::bind(":8088");
        assert_eq!(server.config().hostname, "0.0.0.0");
        assert_eq!(server.config().port, 8088);
    }

    #[test]
    fn start_rejects_duplicate_routes() {
        let mut router = Router::new();
        router.get("/x", |_ctx: RequestContext| async { Ok(Response::ok("a")) });
        router.get("/x", |_ctx: RequestContext| async { Ok(Response::ok("b")) });
        let result = Server::bind("127.0.0.1:0").workers(1).start(router);
        assert!(matches!(result, Err(Error::RouteConflict { .. })));
    }

    #[test]
    fn reuseport_listeners_share_a_port() {
        let addr = resolve("127.0.0.1", 0).unwrap();
        let first = build_listener(addr).unwrap();
        let port = first.local_addr().unwrap().port();
        let mut addr2 = addr;
        addr2.set_port(port);
        let second = build_listener(addr2).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
