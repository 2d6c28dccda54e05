//! Durable per-stage job queue.
//!
//! Stage jobs are delivered through queue entries stored next to them. The
//! queue owns delivery state (attempts, backoff, discard); the job record
//! owns the user-facing status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::repositories::JobRepository;
use crate::domain::{QueueEntry, RetryPolicy, StageJob, StageKind};
use crate::error::StageError;
use crate::{Error, Result};

/// A claimed delivery: the entry in `executing` and the job it delivers.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub entry: QueueEntry,
    pub job: StageJob,
}

/// What the queue decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Delivered again once the backoff elapses.
    RetryAt(DateTime<Utc>),
    /// No further delivery.
    Discarded,
    /// Returned to the queue without consuming the attempt (shutdown).
    Released,
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        !matches!(self, Self::Discarded)
    }
}

pub struct JobQueue {
    repository: Arc<dyn JobRepository>,
    policy: RetryPolicy,
    notifiers: HashMap<StageKind, Arc<Notify>>,
}

impl JobQueue {
    pub fn new(repository: Arc<dyn JobRepository>, policy: RetryPolicy) -> Self {
        let notifiers = StageKind::ALL
            .into_iter()
            .map(|stage| (stage, Arc::new(Notify::new())))
            .collect();
        Self {
            repository,
            policy,
            notifiers,
        }
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wakeup handle for workers of `stage`.
    pub fn notifier(&self, stage: StageKind) -> Arc<Notify> {
        self.notifiers
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    pub fn notify(&self, stage: StageKind) {
        if let Some(notify) = self.notifiers.get(&stage) {
            notify.notify_one();
        }
    }

    /// Persist a new job with its queue entry and wake a worker.
    pub async fn enqueue(&self, job: StageJob) -> Result<StageJob> {
        let entry = QueueEntry::new(job.stage, job.id.clone(), self.policy.max_attempts);
        self.repository.insert_job(&job, &entry).await?;

        info!(
            job_id = %job.id,
            track_id = %job.track_id,
            stage = %job.stage,
            "Enqueued stage job"
        );
        self.notify(job.stage);
        Ok(job)
    }

    /// Claim the next due entry of `stage`.
    ///
    /// An entry whose job record has disappeared is discarded and the next
    /// one is tried.
    pub async fn claim(&self, stage: StageKind) -> Result<Option<ClaimedJob>> {
        loop {
            let Some(mut entry) = self.repository.claim_next(stage, Utc::now()).await? else {
                return Ok(None);
            };

            match self.repository.get_job(&entry.job_id).await {
                Ok(job) => {
                    debug!(
                        job_id = %job.id,
                        attempt = entry.attempt,
                        max_attempts = entry.max_attempts,
                        "Claimed stage job"
                    );
                    return Ok(Some(ClaimedJob { entry, job }));
                }
                Err(Error::NotFound { .. }) => {
                    warn!(entry_id = %entry.id, job_id = %entry.job_id, "Discarding entry without job");
                    entry.mark_discarded(Utc::now(), "job record missing");
                    self.repository.update_entry(&entry).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn complete(&self, entry: &mut QueueEntry) -> Result<()> {
        entry.mark_completed(Utc::now());
        self.repository.update_entry(entry).await
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Deterministic errors and exhausted entries are discarded. Cancellation
    /// hands the attempt back so shutdown never eats retry budget.
    pub async fn fail(&self, entry: &mut QueueEntry, error: &StageError) -> Result<RetryDecision> {
        let now = Utc::now();
        let decision = if matches!(error, StageError::Cancelled) {
            entry.attempt = entry.attempt.saturating_sub(1);
            entry.mark_rescued(now);
            entry.last_error = Some(error.to_string());
            RetryDecision::Released
        } else if error.is_retryable() && !entry.attempts_exhausted() {
            let delay = self.policy.delay_after_attempt(entry.attempt);
            let at = now
                + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));
            entry.mark_retryable(at, error.to_string());
            RetryDecision::RetryAt(at)
        } else {
            entry.mark_discarded(now, error.to_string());
            RetryDecision::Discarded
        };

        self.repository.update_entry(entry).await?;
        match decision {
            RetryDecision::RetryAt(at) => info!(
                job_id = %entry.job_id,
                attempt = entry.attempt,
                retry_at = %at,
                "Stage attempt failed, will retry"
            ),
            RetryDecision::Discarded => warn!(
                job_id = %entry.job_id,
                attempt = entry.attempt,
                kind = error.kind(),
                "Stage job discarded"
            ),
            RetryDecision::Released => {
                debug!(job_id = %entry.job_id, "Stage job released back to the queue");
                self.notify(entry.stage);
            }
        }
        Ok(decision)
    }

    /// Entries of `stage` that could be claimed right now.
    pub async fn depth(&self, stage: StageKind) -> Result<u64> {
        self.repository.count_ready(stage, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryStore;
    use crate::domain::{JobOptions, QueueState};

    fn queue(store: Arc<MemoryStore>, max_attempts: u32) -> JobQueue {
        JobQueue::new(store, RetryPolicy::with_max_attempts(max_attempts).without_jitter())
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), 3);

        let job = queue
            .enqueue(StageJob::new(StageKind::Download, "track-1", JobOptions::new()))
            .await
            .unwrap();
        assert_eq!(queue.depth(StageKind::Download).await.unwrap(), 1);
        assert!(queue.claim(StageKind::Processing).await.unwrap().is_none());

        let claimed = queue.claim(StageKind::Download).await.unwrap().unwrap();
        assert_eq!(claimed.job.id, job.id);
        assert_eq!(claimed.entry.state, QueueState::Executing);
        assert_eq!(claimed.entry.attempt, 1);
        assert!(queue.claim(StageKind::Download).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), 3);
        queue
            .enqueue(StageJob::new(StageKind::Analysis, "track-1", JobOptions::new()))
            .await
            .unwrap();

        let mut claimed = queue.claim(StageKind::Analysis).await.unwrap().unwrap();
        let before = Utc::now();
        let decision = queue
            .fail(&mut claimed.entry, &StageError::Timeout(120))
            .await
            .unwrap();

        let RetryDecision::RetryAt(at) = decision else {
            panic!("expected a retry, got {decision:?}");
        };
        assert!(at >= before + ChronoDuration::seconds(15));
        assert_eq!(claimed.entry.state, QueueState::Retryable);
        // Not due until the backoff elapses.
        assert!(queue.claim(StageKind::Analysis).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deterministic_failure_discards() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), 3);
        queue
            .enqueue(StageJob::new(StageKind::Processing, "track-1", JobOptions::new()))
            .await
            .unwrap();

        let mut claimed = queue.claim(StageKind::Processing).await.unwrap().unwrap();
        let decision = queue
            .fail(
                &mut claimed.entry,
                &StageError::FileNotFound {
                    track_id: "track-1".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Discarded);
        assert_eq!(claimed.entry.attempt, 1);
    }

    #[tokio::test]
    async fn test_last_attempt_discards() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), 1);
        queue
            .enqueue(StageJob::new(StageKind::Download, "track-1", JobOptions::new()))
            .await
            .unwrap();

        let mut claimed = queue.claim(StageKind::Download).await.unwrap().unwrap();
        let decision = queue
            .fail(&mut claimed.entry, &StageError::Script("boom".into()))
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Discarded);
        let stored = store.get_entry(&claimed.entry.id).await.unwrap();
        assert_eq!(stored.state, QueueState::Discarded);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancelled_attempt_is_released() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store.clone(), 3);
        queue
            .enqueue(StageJob::new(StageKind::Download, "track-1", JobOptions::new()))
            .await
            .unwrap();

        let mut claimed = queue.claim(StageKind::Download).await.unwrap().unwrap();
        let decision = queue
            .fail(&mut claimed.entry, &StageError::Cancelled)
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::Released);
        assert!(decision.will_retry());

        let again = queue.claim(StageKind::Download).await.unwrap().unwrap();
        assert_eq!(again.entry.attempt, 1);
    }
}
