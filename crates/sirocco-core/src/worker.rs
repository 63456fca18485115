//! Worker threads: each runs a current-thread runtime with its own
//! SO_REUSEPORT listener and accept loop. A connection lives and dies on
//! the worker that accepted it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::metrics::WorkerMetrics;
use crate::server::Engine;
use crate::shutdown::Phase;

#[cfg(feature = "tls")]
pub(crate) type TlsHandle = Option<tokio_rustls::TlsAcceptor>;
#[cfg(not(feature = "tls"))]
pub(crate) type TlsHandle = Option<()>;

pub(crate) fn spawn(
    id: usize,
    listener: std::net::TcpListener,
    engine: Arc<Engine>,
    tls: TlsHandle,
    core: Option<core_affinity::CoreId>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("sirocco-worker-{id}"))
        .spawn(move || {
            if let Some(core) = core {
                core_affinity::set_for_current(core);
            }
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("worker {id} failed to build runtime: {e}");
                    return;
                }
            };
            rt.block_on(run(id, listener, engine, tls));
        })
}

async fn run(id: usize, listener: std::net::TcpListener, engine: Arc<Engine>, tls: TlsHandle) {
    crate::parser::init_date_cache();

    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("worker {id} failed to register listener: {e}");
            return;
        }
    };

    let metrics = Arc::new(WorkerMetrics::new());
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut phase_rx = engine.shutdown.subscribe();
    tracing::debug!("worker {id} accepting");

    loop {
        tokio::select! {
            biased;
            changed = phase_rx.changed() => {
                if changed.is_err() || *phase_rx.borrow() != Phase::Running {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    spawn_conn(&mut tasks, stream, peer, &engine, &tls, &metrics);
                }
                Err(e) => {
                    tracing::error!("worker {id} accept error: {e}");
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                reap(joined);
            }
        }
    }

    // Shutting down: no more accepts; let in-flight connections finish and
    // abort whatever survives the force-close deadline.
    drop(listener);
    loop {
        tokio::select! {
            _ = engine.shutdown.force_closed() => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(joined) => reap(joined),
                None => break,
            },
        }
    }
    let totals = metrics.snapshot();
    tracing::debug!(
        "worker {id} exited after {} requests, {} bytes sent",
        totals.requests,
        totals.bytes_tx
    );
}

/// A connection task that panicked is logged and dropped; the worker keeps
/// serving.
fn reap(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        tracing::error!("connection task panicked: {e}");
    }
}

fn spawn_conn(
    tasks: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    engine: &Arc<Engine>,
    tls: &TlsHandle,
    metrics: &Arc<WorkerMetrics>,
) {
    engine.shutdown.conn_opened();
    metrics.conn_opened();
    let guard = ConnGuard { engine: engine.clone(), metrics: metrics.clone() };
    let engine = engine.clone();
    let tls = tls.clone();
    let metrics = metrics.clone();
    tasks.spawn(async move {
        let _guard = guard;
        conn_entry(stream, peer, engine, tls, metrics).await;
    });
}

/// Keeps the connection gauges honest on every exit path, including panic
/// unwind and force-close abort.
struct ConnGuard {
    engine: Arc<Engine>,
    metrics: Arc<WorkerMetrics>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.metrics.conn_closed();
        self.engine.shutdown.conn_closed();
    }
}

async fn conn_entry(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    tls: TlsHandle,
    metrics: Arc<WorkerMetrics>,
) {
    #[cfg(feature = "tls")]
    if let Some(acceptor) = tls {
        let handshake =
            tokio::time::timeout(std::time::Duration::from_secs(10), acceptor.accept(stream));
        match handshake.await {
            Ok(Ok(tls_stream)) => {
                match crate::tls::negotiated(&tls_stream) {
                    #[cfg(feature = "http2")]
                    crate::tls::Alpn::H2 if engine.config.http2.enabled => {
                        crate::h2c::serve(tls_stream, Some(peer), engine, metrics).await;
                    }
                    _ => {
                        crate::conn::serve_connection(
                            Box::new(tls_stream),
                            Some(peer),
                            true,
                            engine,
                            metrics,
                        )
                        .await;
                    }
                }
            }
            Ok(Err(e)) => {
                // Handshake failure: close silently.
                tracing::debug!("tls handshake failed: {e}");
            }
            Err(_) => {
                tracing::debug!("tls handshake timed out");
            }
        }
        return;
    }

    #[cfg(not(feature = "tls"))]
    let _ = tls;

    crate::conn::serve_connection(Box::new(stream), Some(peer), false, engine, metrics).await;
}
