//! Sirocco cluster mode: a primary process supervising N worker processes.
//!
//! Each worker runs an independent `sirocco-core` server; the primary never
//! proxies traffic. Workers bind with SO_REUSEPORT semantics (the engine's
//! default), so the kernel distributes accepts across processes.
//!
//! The worker protocol is line-oriented: a child announces readiness by
//! printing [`READY_LINE`] on stdout, and shuts down gracefully on SIGTERM.
//!
//! ```no_run
//! use std::time::Duration;
//! use sirocco_cluster::{ClusterConfig, Supervisor, is_worker_process, run_worker};
//! use sirocco_core::prelude::*;
//!
//! fn main() {
//!     init_logging();
//!     if is_worker_process() {
//!         let mut router = Router::new();
//!         router.get("/", |_ctx: RequestContext| async { Ok(Response::ok("hi")) });
//!         let handle = Server::bind("0.0.0.0:8080").start(router).unwrap();
//!         std::process::exit(run_worker(handle, Duration::from_secs(30)));
//!     }
//!     let supervisor = Supervisor::new(ClusterConfig::default());
//!     std::process::exit(supervisor.run());
//! }
//! ```

mod supervisor;

pub use supervisor::{ClusterConfig, Supervisor, SupervisorError};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Line a worker prints on stdout once it is serving traffic.
pub const READY_LINE: &str = "sirocco-worker-ready";

/// Environment variable marking a process as a cluster worker; its value is
/// the worker slot id.
pub const WORKER_ENV: &str = "SIROCCO_WORKER";

/// True when this process was spawned as a cluster worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// The worker slot id assigned by the supervisor.
pub fn worker_id() -> Option<usize> {
    std::env::var(WORKER_ENV).ok()?.parse().ok()
}

/// Announce readiness to the supervisor.
pub fn signal_ready() {
    use std::io::Write;
    let mut out = std::io::stdout();
    let _ = writeln!(out, "{READY_LINE}");
    let _ = out.flush();
}

/// Worker-side main loop: signal readiness, then serve until SIGTERM or
/// SIGINT triggers a graceful stop bounded by `shutdown_timeout`.
///
/// Returns the process exit code.
pub fn run_worker(handle: sirocco_core::ServerHandle, shutdown_timeout: Duration) -> i32 {
    signal_ready();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        stop_signal.store(true, Ordering::Release);
    }) {
        tracing::error!("failed to install signal handler: {e}");
        return 1;
    }

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    let drained = handle.stop_blocking(shutdown_timeout);
    if !drained {
        tracing::warn!("worker force-closed connections at the shutdown deadline");
    }
    handle.join();
    0
}
