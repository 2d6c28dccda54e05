//! Worker pool implementation for pipeline stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::StageWorker;
use crate::domain::StageKind;

/// Extra time a tick gets on top of the runner timeout before the pool
/// gives up on it. The rescue sweep recovers whatever it leaves behind.
pub const TICK_GRACE: Duration = Duration::from_secs(30);

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// Runner timeout for the stage in seconds.
    pub job_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            job_timeout_secs: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerPoolConfig {
    /// Upper bound for one tick.
    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs) + TICK_GRACE
    }
}

/// A bounded pool of workers for one stage.
pub struct WorkerPool {
    stage: StageKind,
    config: WorkerPoolConfig,
    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
    /// Workers currently inside a tick.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

struct ActiveWorker(Arc<AtomicUsize>);

impl ActiveWorker {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(stage: StageKind) -> Self {
        Self::with_config(stage, WorkerPoolConfig::default())
    }

    pub fn with_config(stage: StageKind, config: WorkerPoolConfig) -> Self {
        Self {
            stage,
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn `max_workers` loops that tick `worker` until stopped.
    pub fn start(&self, worker: Arc<StageWorker>, notifier: Arc<Notify>) {
        let stage = self.stage;
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let tick_timeout = self.config.tick_timeout();

        info!(
            "Starting {} worker pool with {} max workers",
            stage, self.config.max_workers
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("{} worker pool already stopped", stage);
            return;
        };

        for i in 0..self.config.max_workers {
            let semaphore = self.semaphore.clone();
            let cancellation_token = self.cancellation_token.clone();
            let active_workers = self.active_workers.clone();
            let worker = worker.clone();
            let notifier = notifier.clone();

            join_set.spawn(async move {
                debug!("{} worker {} started", stage, i);
                // Start with a claim so work queued before startup is picked up.
                let mut busy = true;

                loop {
                    if cancellation_token.is_cancelled() {
                        debug!("{} worker {} shutting down", stage, i);
                        break;
                    }

                    // Keep draining while there is work; otherwise wait.
                    if !busy {
                        tokio::select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }

                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        busy = false;
                        continue;
                    };

                    let _active = ActiveWorker::enter(&active_workers);
                    busy = match tokio::time::timeout(tick_timeout, worker.tick()).await {
                        Ok(Ok(Some(report))) => {
                            debug!(
                                "{} worker {} finished job {} (attempt {})",
                                stage, i, report.job_id, report.attempt
                            );
                            true
                        }
                        Ok(Ok(None)) => false,
                        Ok(Err(e)) => {
                            error!("{} worker {} tick failed: {}", stage, i, e);
                            false
                        }
                        Err(_) => {
                            // The claimed entry stays executing until rescued.
                            warn!(
                                "{} worker {} tick exceeded {:?}, abandoning it",
                                stage, i, tick_timeout
                            );
                            false
                        }
                    };
                    drop(permit);
                }
            });
        }
    }

    /// Stop the pool and wait for in-flight ticks to finish.
    pub async fn stop(&self) {
        info!("Stopping {} worker pool", self.stage);
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("{} worker pool stopped", self.stage);
    }

    /// Workers currently running a tick.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
