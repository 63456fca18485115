//! The primary process: spawn workers, restart crashed ones (rate-limited),
//! roll restarts, scale, and drive cluster-wide graceful shutdown.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{READY_LINE, WORKER_ENV};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker {id}: {source}")]
    Spawn { id: usize, source: std::io::Error },

    #[error("worker {id} did not become ready within {timeout:?}")]
    ReadyTimeout { id: usize, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Worker process count.
    pub workers: usize,
    /// Respawn workers that exit while the cluster is running.
    pub auto_restart: bool,
    /// Restart budget per worker slot per minute; exceeding it abandons the
    /// slot.
    pub max_restarts_per_minute: u32,
    /// How long a new worker may take to print its ready line.
    pub ready_timeout: Duration,
    /// Bound on cluster-wide graceful shutdown; survivors are killed.
    pub shutdown_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(8),
            auto_restart: true,
            max_restarts_per_minute: 5,
            ready_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

struct WorkerProc {
    id: usize,
    pid: u32,
    child: Child,
    ready: Arc<AtomicBool>,
}

impl WorkerProc {
    fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.ready.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        self.ready.load(Ordering::Acquire)
    }

    fn terminate(&self) {
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Bounded wait for the child to exit; false when it is still running
    /// at the deadline.
    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(_) => return true,
            }
        }
    }
}

struct Slot {
    id: usize,
    worker: Option<WorkerProc>,
    /// Recent restart timestamps, pruned to the trailing minute.
    restarts: Vec<Instant>,
    abandoned: bool,
}

/// The cluster primary.
pub struct Supervisor {
    config: ClusterConfig,
    program: std::path::PathBuf,
    args: Vec<String>,
    slots: Vec<Slot>,
    shutting_down: Arc<AtomicBool>,
}

impl Supervisor {
    /// Supervise workers running the current executable (re-exec model);
    /// workers detect their role via [`WORKER_ENV`].
    pub fn new(config: ClusterConfig) -> Self {
        let program = std::env::current_exe().unwrap_or_else(|e| {
            tracing::error!("cannot determine current executable: {e}");
            std::path::PathBuf::from("sirocco-worker")
        });
        Self::with_command(config, program, Vec::new())
    }

    /// Supervise an explicit worker command. Used directly in tests and by
    /// embedders whose worker is a separate binary.
    pub fn with_command(
        config: ClusterConfig,
        program: impl Into<std::path::PathBuf>,
        args: Vec<String>,
    ) -> Self {
        let slots = (0..config.workers)
            .map(|id| Slot { id, worker: None, restarts: Vec::new(), abandoned: false })
            .collect();
        Self {
            config,
            program: program.into(),
            args,
            slots,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.slots.iter().filter(|s| s.worker.is_some()).count()
    }

    pub fn worker_pids(&self) -> Vec<(usize, u32)> {
        self.slots
            .iter()
            .filter_map(|s| s.worker.as_ref().map(|w| (s.id, w.pid)))
            .collect()
    }

    fn spawn_worker(&self, id: usize) -> Result<WorkerProc, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, id.to_string())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn { id, source })?;
        let pid = child.id();

        let ready = Arc::new(AtomicBool::new(false));
        if let Some(stdout) = child.stdout.take() {
            let ready_flag = ready.clone();
            std::thread::Builder::new()
                .name(format!("sirocco-reader-{id}"))
                .spawn(move || {
                    let reader = BufReader::new(stdout);
                    for line in reader.lines() {
                        let Ok(line) = line else { break };
                        if line.trim() == READY_LINE {
                            ready_flag.store(true, Ordering::Release);
                        } else {
                            // Forward worker output under its slot id.
                            println!("[worker {id}] {line}");
                        }
                    }
                })
                .ok();
        }

        tracing::info!("spawned worker {id} (pid {pid})");
        Ok(WorkerProc { id, pid, child, ready })
    }

    /// Spawn every empty, non-abandoned slot and wait for readiness.
    pub fn spawn_all(&mut self) -> Result<(), SupervisorError> {
        for i in 0..self.slots.len() {
            if self.slots[i].worker.is_some() || self.slots[i].abandoned {
                continue;
            }
            let worker = self.spawn_worker(self.slots[i].id)?;
            if !worker.wait_ready(self.config.ready_timeout) {
                let id = worker.id;
                let mut worker = worker;
                worker.kill();
                return Err(SupervisorError::ReadyTimeout {
                    id,
                    timeout: self.config.ready_timeout,
                });
            }
            self.slots[i].worker = Some(worker);
        }
        Ok(())
    }

    /// Restart budget check for one slot: prune to the trailing minute and
    /// record the new attempt.
    fn restart_allowed(slot: &mut Slot, max_per_minute: u32) -> bool {
        let cutoff = Instant::now() - Duration::from_secs(60);
        slot.restarts.retain(|t| *t > cutoff);
        if slot.restarts.len() as u32 >= max_per_minute {
            return false;
        }
        slot.restarts.push(Instant::now());
        true
    }

    /// One monitoring pass: reap exited workers and respawn them under the
    /// restart budget. Returns false once every slot is abandoned.
    pub fn monitor_once(&mut self) -> bool {
        for slot in &mut self.slots {
            let exited = match &mut slot.worker {
                Some(worker) => matches!(worker.child.try_wait(), Ok(Some(_)) | Err(_)),
                None => false,
            };
            if !exited {
                continue;
            }
            slot.worker = None;
            if self.shutting_down.load(Ordering::Acquire) || !self.config.auto_restart {
                continue;
            }
            if !Self::restart_allowed(slot, self.config.max_restarts_per_minute) {
                tracing::error!("worker slot {} exhausted its restart budget; abandoning", slot.id);
                slot.abandoned = true;
                continue;
            }
            tracing::warn!("worker {} exited; respawning", slot.id);
        }

        // Respawn outside the borrow of the iteration above.
        for i in 0..self.slots.len() {
            if self.slots[i].worker.is_none()
                && !self.slots[i].abandoned
                && !self.shutting_down.load(Ordering::Acquire)
                && self.config.auto_restart
            {
                match self.spawn_worker(self.slots[i].id) {
                    Ok(worker) => self.slots[i].worker = Some(worker),
                    Err(e) => tracing::error!("respawn failed: {e}"),
                }
            }
        }

        !self.slots.iter().all(|s| s.abandoned)
    }

    /// Replace workers one at a time: spawn the successor, wait for its
    /// ready line, then gracefully retire the predecessor. A successor that
    /// never becomes ready aborts the whole rolling restart.
    pub fn rolling_restart(&mut self) -> Result<(), SupervisorError> {
        for i in 0..self.slots.len() {
            if self.slots[i].abandoned {
                continue;
            }
            let id = self.slots[i].id;
            let replacement = self.spawn_worker(id)?;
            if !replacement.wait_ready(self.config.ready_timeout) {
                let mut replacement = replacement;
                replacement.kill();
                return Err(SupervisorError::ReadyTimeout {
                    id,
                    timeout: self.config.ready_timeout,
                });
            }

            if let Some(mut old) = self.slots[i].worker.take() {
                old.terminate();
                if !old.wait_exit(self.config.shutdown_timeout) {
                    tracing::warn!("worker {id} ignored SIGTERM during rolling restart; killing");
                    old.kill();
                }
            }
            self.slots[i].worker = Some(replacement);
            tracing::info!("rolled worker {id}");
        }
        Ok(())
    }

    /// Add or remove workers to reach `target`, using the same
    /// ready/shutdown discipline as the rolling restart.
    pub fn scale(&mut self, target: usize) -> Result<(), SupervisorError> {
        while self.slots.len() < target {
            let id = self.slots.len();
            let worker = self.spawn_worker(id)?;
            if !worker.wait_ready(self.config.ready_timeout) {
                let mut worker = worker;
                worker.kill();
                return Err(SupervisorError::ReadyTimeout {
                    id,
                    timeout: self.config.ready_timeout,
                });
            }
            self.slots.push(Slot {
                id,
                worker: Some(worker),
                restarts: Vec::new(),
                abandoned: false,
            });
            tracing::info!("scaled up to {} workers", self.slots.len());
        }

        while self.slots.len() > target {
            if let Some(mut slot) = self.slots.pop()
                && let Some(mut worker) = slot.worker.take()
            {
                worker.terminate();
                if !worker.wait_exit(self.config.shutdown_timeout) {
                    worker.kill();
                }
                tracing::info!("scaled down, retired worker {}", slot.id);
            }
        }
        Ok(())
    }

    /// Cluster-wide graceful shutdown bounded by `shutdown_timeout`.
    /// Returns true when every worker exited before the deadline.
    pub fn shutdown(&mut self) -> bool {
        self.shutting_down.store(true, Ordering::Release);
        for slot in &self.slots {
            if let Some(worker) = &slot.worker {
                worker.terminate();
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let mut clean = true;
        for slot in &mut self.slots {
            if let Some(worker) = &mut slot.worker {
                let left = deadline.saturating_duration_since(Instant::now());
                if !worker.wait_exit(left) {
                    tracing::warn!("killing worker {} at the shutdown deadline", slot.id);
                    worker.kill();
                    clean = false;
                }
            }
            slot.worker = None;
        }
        clean
    }

    /// Run the cluster until a termination signal arrives.
    ///
    /// Exit code: 0 on clean shutdown, non-zero when the spawn loop was
    /// exhausted (every slot abandoned) or startup failed.
    pub fn run(mut self) -> i32 {
        let stop = self.shutting_down.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Release);
        }) {
            tracing::error!("failed to install signal handler: {e}");
            return 1;
        }

        if let Err(e) = self.spawn_all() {
            tracing::error!("cluster startup failed: {e}");
            self.shutdown();
            return 1;
        }
        tracing::info!("cluster running with {} workers", self.worker_count());

        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                self.shutdown();
                return 0;
            }
            if !self.monitor_once() {
                tracing::error!("all worker slots exhausted; exiting");
                return 1;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A well-behaved fake worker: announces readiness, sleeps, exits on
    /// SIGTERM (sh's default disposition).
    fn ready_worker_cmd() -> (std::path::PathBuf, Vec<String>) {
        (
            "/bin/sh".into(),
            vec!["-c".into(), format!("echo {READY_LINE}; sleep 30")],
        )
    }

    fn config(workers: usize) -> ClusterConfig {
        ClusterConfig {
            workers,
            auto_restart: true,
            max_restarts_per_minute: 3,
            ready_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn spawns_and_shuts_down() {
        let (program, args) = ready_worker_cmd();
        let mut sup = Supervisor::with_command(config(2), program, args);
        sup.spawn_all().unwrap();
        assert_eq!(sup.worker_count(), 2);
        let pids = sup.worker_pids();
        assert_eq!(pids.len(), 2);
        assert!(sup.shutdown());
        assert_eq!(sup.worker_count(), 0);
    }

    #[test]
    fn ready_timeout_aborts_startup() {
        // Worker that never prints the ready line.
        let mut sup = Supervisor::with_command(
            ClusterConfig { ready_timeout: Duration::from_millis(200), ..config(1) },
            "/bin/sh",
            vec!["-c".into(), "sleep 30".into()],
        );
        let err = sup.spawn_all().unwrap_err();
        assert!(matches!(err, SupervisorError::ReadyTimeout { id: 0, .. }));
    }

    #[test]
    fn crashed_worker_is_respawned() {
        // Exits immediately after signalling ready.
        let mut sup = Supervisor::with_command(
            config(1),
            "/bin/sh",
            vec!["-c".into(), format!("echo {READY_LINE}")],
        );
        sup.spawn_all().unwrap();
        // Give the child time to exit.
        std::thread::sleep(Duration::from_millis(200));
        assert!(sup.monitor_once());
        assert_eq!(sup.worker_count(), 1);
        sup.shutdown();
    }

    #[test]
    fn restart_budget_abandons_slot() {
        let mut sup = Supervisor::with_command(
            ClusterConfig { max_restarts_per_minute: 2, ..config(1) },
            "/bin/sh",
            vec!["-c".into(), format!("echo {READY_LINE}")],
        );
        sup.spawn_all().unwrap();
        // Each pass reaps the dead child and respawns until the budget runs
        // out; the slot is then abandoned and monitor_once reports a dead
        // cluster.
        let mut alive = true;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(150));
            alive = sup.monitor_once();
            if !alive {
                break;
            }
        }
        assert!(!alive, "slot should be abandoned after exhausting the budget");
        sup.shutdown();
    }

    #[test]
    fn scale_up_and_down() {
        let (program, args) = ready_worker_cmd();
        let mut sup = Supervisor::with_command(config(1), program, args);
        sup.spawn_all().unwrap();
        assert_eq!(sup.worker_count(), 1);

        sup.scale(3).unwrap();
        assert_eq!(sup.worker_count(), 3);

        sup.scale(1).unwrap();
        assert_eq!(sup.worker_count(), 1);
        sup.shutdown();
    }

    #[test]
    fn rolling_restart_replaces_pids() {
        let (program, args) = ready_worker_cmd();
        let mut sup = Supervisor::with_command(config(2), program, args);
        sup.spawn_all().unwrap();
        let before = sup.worker_pids();

        sup.rolling_restart().unwrap();
        let after = sup.worker_pids();
        assert_eq!(after.len(), 2);
        for ((id_a, pid_a), (id_b, pid_b)) in before.iter().zip(after.iter()) {
            assert_eq!(id_a, id_b);
            assert_ne!(pid_a, pid_b, "slot {id_a} should run a new process");
        }
        sup.shutdown();
    }

    #[test]
    fn rolling_restart_aborts_on_ready_timeout() {
        let (program, args) = ready_worker_cmd();
        let mut sup = Supervisor::with_command(config(1), program, args);
        sup.spawn_all().unwrap();
        let before = sup.worker_pids();

        // Swap in a worker command that never becomes ready.
        sup.args = vec!["-c".into(), "sleep 30".into()];
        sup.config.ready_timeout = Duration::from_millis(200);
        assert!(sup.rolling_restart().is_err());
        // The old worker is still in place.
        assert_eq!(sup.worker_pids(), before);
        sup.shutdown();
    }
}
