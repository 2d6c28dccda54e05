//! Periodic recovery of jobs orphaned by a crashed or stalled worker.
//!
//! An entry that has been executing for longer than the rescue window is
//! assumed lost. It goes back to the queue, or is discarded when it has no
//! attempts left, and its job record follows.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_queue::JobQueue;
use super::worker::notify_batch;
use crate::Result;
use crate::batch::BatchOrchestrator;
use crate::database::repositories::job::ORPHANED_ERROR;
use crate::domain::{QueueState, StageKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescueConfig {
    /// Seconds an entry may stay executing before it is considered orphaned.
    #[serde(default = "default_rescue_after_secs")]
    pub rescue_after_secs: u64,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_rescue_after_secs() -> u64 {
    30 * 60
}

fn default_check_interval_secs() -> u64 {
    60
}

impl Default for RescueConfig {
    fn default() -> Self {
        Self {
            rescue_after_secs: default_rescue_after_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescueReport {
    pub requeued: usize,
    pub discarded: usize,
}

pub struct RescueService {
    config: RescueConfig,
    queue: Arc<JobQueue>,
    batches: Option<Arc<BatchOrchestrator>>,
}

impl RescueService {
    pub fn new(config: RescueConfig, queue: Arc<JobQueue>) -> Self {
        Self {
            config,
            queue,
            batches: None,
        }
    }

    pub fn with_batches(mut self, batches: Arc<BatchOrchestrator>) -> Self {
        self.batches = Some(batches);
        self
    }

    /// Run one sweep.
    pub async fn run_rescue(&self) -> Result<RescueReport> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(self.config.rescue_after_secs as i64);
        let repository = self.queue.repository();
        let entries = repository.rescue_orphaned(cutoff, now).await?;

        let mut report = RescueReport::default();
        for entry in entries {
            let mut job = match repository.get_job(&entry.job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %entry.job_id, error = %e, "Rescued entry has no readable job");
                    continue;
                }
            };
            if job.status.is_terminal() {
                debug!(job_id = %job.id, status = %job.status, "Rescued entry for a finished job");
                continue;
            }

            if entry.state == QueueState::Discarded {
                job.mark_failed(ORPHANED_ERROR);
                report.discarded += 1;
            } else {
                job.mark_requeued(Some(ORPHANED_ERROR.to_string()));
                report.requeued += 1;
            }
            repository.update_job(&job).await?;

            warn!(
                job_id = %job.id,
                stage = %job.stage,
                attempt = entry.attempt,
                state = %entry.state,
                "Rescued orphaned stage job"
            );

            if entry.state == QueueState::Discarded {
                if let (Some(batches), Some(batch_id), StageKind::Processing) =
                    (&self.batches, &job.batch_id, job.stage)
                {
                    notify_batch(batches, batch_id).await;
                }
            } else {
                self.queue.notify(job.stage);
            }
        }

        if report.requeued + report.discarded > 0 {
            info!(
                requeued = report.requeued,
                discarded = report.discarded,
                "Rescue sweep finished"
            );
        }
        Ok(report)
    }

    /// Spawn the periodic rescue loop.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

            info!(
                rescue_after_secs = self.config.rescue_after_secs,
                interval_secs = self.config.check_interval_secs,
                "Rescue service started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Rescue service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_rescue().await {
                            error!("Rescue cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &RescueConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{JobRepository, MemoryStore};
    use crate::domain::{JobOptions, JobStatus, RetryPolicy, StageJob};

    async fn orphan(store: &Arc<MemoryStore>, queue: &JobQueue, max_attempts: u32) -> StageJob {
        let job = StageJob::new(StageKind::Download, "track-1", JobOptions::new());
        let job = queue.enqueue(job).await.unwrap();
        let mut entry = store.get_entry_for_job(&job.id).await.unwrap();
        entry.max_attempts = max_attempts;
        entry.mark_executing(Utc::now() - chrono::Duration::hours(1));
        store.update_entry(&entry).await.unwrap();

        let mut job = job;
        job.mark_active().unwrap();
        store.update_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_rescue_requeues_orphans() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), RetryPolicy::default()));
        let job = orphan(&store, &queue, 3).await;

        let service = RescueService::new(RescueConfig::default(), queue.clone());
        let report = service.run_rescue().await.unwrap();
        assert_eq!(report, RescueReport { requeued: 1, discarded: 0 });

        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.error.as_deref(), Some(ORPHANED_ERROR));

        let claimed = queue.claim(StageKind::Download).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, job.id);
        assert_eq!(claimed.entry.attempt, 2);
    }

    #[tokio::test]
    async fn test_rescue_fails_exhausted_orphans() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), RetryPolicy::default()));
        let job = orphan(&store, &queue, 1).await;

        let service = RescueService::new(RescueConfig::default(), queue.clone());
        let report = service.run_rescue().await.unwrap();
        assert_eq!(report, RescueReport { requeued: 0, discarded: 1 });
        assert_eq!(
            store.get_job(&job.id).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_recent_entries_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), RetryPolicy::default()));
        queue
            .enqueue(StageJob::new(StageKind::Download, "track-1", JobOptions::new()))
            .await
            .unwrap();
        queue.claim(StageKind::Download).await.unwrap().unwrap();

        let service = RescueService::new(RescueConfig::default(), queue);
        assert_eq!(service.run_rescue().await.unwrap(), RescueReport::default());
    }
}
