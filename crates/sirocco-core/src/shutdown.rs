//! Graceful shutdown: connection draining with a deadline-bounded stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};

/// Lifecycle phase broadcast to every worker and connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// No new connections; in-flight requests run to completion and
    /// keep-alive sockets close as they go idle.
    Draining,
    /// Deadline expired; remaining connection tasks are aborted.
    ForceClose,
}

/// Shared drain state. One instance per server, cloned into every worker.
pub struct ShutdownState {
    phase: watch::Sender<Phase>,
    active: AtomicUsize,
    drained: Notify,
}

impl ShutdownState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self { phase, active: AtomicUsize::new(0), drained: Notify::new() }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != Phase::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn conn_opened(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn conn_closed(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once the force-close phase begins. Used by workers to abort
    /// connection tasks past the drain deadline.
    pub async fn force_closed(&self) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow() == Phase::ForceClose {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone; stay pending forever rather than spuriously
                // aborting live connections.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drain with a deadline. Returns true when every connection closed in
    /// time; on expiry, flips to force-close and returns false.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let _ = self.phase.send(Phase::Draining);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.active_connections() == 0 {
                return true;
            }
            let notified = self.drained.notified();
            if self.active_connections() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if self.active_connections() == 0 {
                    return true;
                }
                let _ = self.phase.send(Phase::ForceClose);
                return false;
            }
        }
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn drain_returns_true_when_idle() {
        let state = ShutdownState::new();
        assert!(state.drain(Duration::from_millis(50)).await);
        assert!(state.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_connections() {
        let state = Arc::new(ShutdownState::new());
        state.conn_opened();
        state.conn_opened();

        let closer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.conn_closed();
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.conn_closed();
        });

        assert!(state.drain(Duration::from_secs(5)).await);
        assert_eq!(state.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_deadline_forces_close() {
        let state = Arc::new(ShutdownState::new());
        state.conn_opened();

        let force_seen = {
            let state = state.clone();
            tokio::spawn(async move {
                state.force_closed().await;
                true
            })
        };

        assert!(!state.drain(Duration::from_millis(100)).await);
        assert_eq!(state.phase(), Phase::ForceClose);
        assert!(force_seen.await.unwrap());
    }
}
