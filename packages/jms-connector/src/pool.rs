//! Shared worker pool for blocking broker I/O.
//!
//! Zero core threads, a bounded maximum, and a synchronous handoff: a job
//! is handed to an idle worker if one is waiting, otherwise a new worker is
//! spawned while the pool is below its maximum, otherwise the job is
//! rejected. Idle workers exit after the configured TTL.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use reactive_messaging::ConnectorError;
use tracing::{debug, warn};

use crate::config::PoolConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerCommand {
    Run(Job),
    Stop,
}

struct PoolInner {
    config: PoolConfig,
    handoff_tx: Sender<WorkerCommand>,
    handoff_rx: Receiver<WorkerCommand>,
    live: AtomicUsize,
    next_id: AtomicUsize,
    closed: AtomicBool,
}

/// Process-wide pool of blocking worker threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Decrements the live count when a worker thread ends, panics included.
struct LiveGuard(Arc<PoolInner>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        let (handoff_tx, handoff_rx) = crossbeam::channel::bounded(0);
        Self {
            inner: Arc::new(PoolInner {
                config,
                handoff_tx,
                handoff_rx,
                live: AtomicUsize::new(0),
                next_id: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool sizing.
    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Number of worker threads alive, busy or idle.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Whether [`shutdown`](Self::shutdown) ran.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Run `job` on a pool thread.
    ///
    /// Fails with `POOL_EXHAUSTED` when every worker is busy and the pool
    /// is at its maximum, and with `NOT_RUNNING` after shutdown.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> Result<(), ConnectorError> {
        if self.is_shut_down() {
            return Err(ConnectorError::NotRunning("jms worker pool".to_string()));
        }
        match self.inner.handoff_tx.try_send(WorkerCommand::Run(Box::new(job))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(WorkerCommand::Run(job))) => self.spawn(job),
            Err(TrySendError::Full(WorkerCommand::Stop)) | Err(TrySendError::Disconnected(_)) => {
                Err(ConnectorError::NotRunning("jms worker pool".to_string()))
            }
        }
    }

    fn reserve_slot(&self) -> bool {
        let max = self.inner.config.max_size;
        self.inner
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    fn spawn(&self, job: Job) -> Result<(), ConnectorError> {
        if !self.reserve_slot() {
            warn!(max = self.inner.config.max_size, "jms worker pool exhausted");
            return Err(ConnectorError::PoolExhausted);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("jms-worker-{id}"))
            .spawn(move || run_worker(inner, job));
        match spawned {
            Ok(_) => {
                debug!(worker = id, live = self.live(), "jms worker spawned");
                Ok(())
            }
            Err(e) => {
                self.inner.live.fetch_sub(1, Ordering::SeqCst);
                warn!(error = %e, "failed to spawn jms worker");
                Err(ConnectorError::PoolExhausted)
            }
        }
    }

    /// Stop accepting work and release idle workers. Busy workers exit
    /// once their current job returns.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.inner.handoff_tx.try_send(WorkerCommand::Stop).is_ok() {}
        debug!(live = self.live(), "jms worker pool shut down");
    }
}

fn run_worker(inner: Arc<PoolInner>, first: Job) {
    let _guard = LiveGuard(inner.clone());
    first();
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match inner.handoff_rx.recv_timeout(inner.config.ttl) {
            Ok(WorkerCommand::Run(job)) => job(),
            Ok(WorkerCommand::Stop) => return,
            Err(RecvTimeoutError::Timeout) => {
                debug!("idle jms worker expired");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("live", &self.live())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pool(max_size: usize, ttl: Duration) -> WorkerPool {
        WorkerPool::new(PoolConfig { max_size, ttl })
    }

    fn wait_for(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_submit_runs_job_on_named_thread() {
        let pool = pool(2, Duration::from_secs(1));
        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.submit(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert!(name.starts_with("jms-worker-"));
    }

    #[test]
    fn test_exhausted_when_all_workers_busy() {
        let pool = pool(2, Duration::from_secs(1));
        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        for _ in 0..2 {
            let release = release_rx.clone();
            pool.submit(move || {
                let _ = release.recv();
            })
            .unwrap();
        }
        assert_eq!(pool.live(), 2);

        let err = pool.submit(|| {}).unwrap_err();
        assert_eq!(err, ConnectorError::PoolExhausted);

        drop(release_tx);
        pool.shutdown();
    }

    #[test]
    fn test_idle_worker_is_reused() {
        let pool = pool(4, Duration::from_secs(5));
        let (tx, rx) = crossbeam::channel::unbounded();
        let first = tx.clone();
        pool.submit(move || {
            let _ = first.send(1);
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 1);

        // The worker parks in the handoff once its job returns.
        assert!(wait_for(|| {
            let tx = tx.clone();
            pool.inner
                .handoff_tx
                .try_send(WorkerCommand::Run(Box::new(move || {
                    let _ = tx.send(2);
                })))
                .is_ok()
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(pool.live(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_idle_workers_expire_after_ttl() {
        let pool = pool(2, Duration::from_millis(20));
        pool.submit(|| {}).unwrap();
        assert!(wait_for(|| pool.live() == 0));
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let pool = pool(2, Duration::from_secs(5));
        pool.submit(|| {}).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.submit(|| {}).unwrap_err().kind(), "NOT_RUNNING");
        assert!(wait_for(|| pool.live() == 0));
    }

    #[test]
    fn test_panicking_job_releases_its_slot() {
        let pool = pool(1, Duration::from_secs(5));
        pool.submit(|| panic!("job failed")).unwrap();
        assert!(wait_for(|| pool.live() == 0));
        pool.submit(|| {}).unwrap();
    }
}
