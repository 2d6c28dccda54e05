//! Batch orchestration: fan one request out into many processing jobs and
//! aggregate their outcomes.
//!
//! Aggregation is pull-based. [`BatchOrchestrator::update_batch_progress`]
//! recomputes the header from the linked processing jobs every time it is
//! called; nothing is incremented in place.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::database::repositories::{BatchRepository, JobRepository};
use crate::domain::{BatchCounts, BatchJob, BatchStatus, DemucsModel, JobOptions, StageJob, StageKind};
use crate::events::{EventBus, PipelineEvent, Topic};
use crate::pipeline::JobQueue;
use crate::source::SourceLocator;
use crate::{Error, Result};

/// Largest accepted batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Outcome of [`BatchOrchestrator::start_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchStart {
    pub batch: BatchJob,
    pub processing_job_ids: Vec<String>,
    /// `(track_id, reason)` for every track that could not be queued.
    pub errors: Vec<(String, String)>,
}

/// Read-only projection of a batch and its live counts.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch: BatchJob,
    pub counts: BatchCounts,
}

pub struct BatchOrchestrator {
    batches: Arc<dyn BatchRepository>,
    queue: Arc<JobQueue>,
    locator: Arc<dyn SourceLocator>,
    events: Arc<dyn EventBus>,
    /// Per-batch locks serializing the count-then-write recomputation.
    recompute_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl BatchOrchestrator {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        queue: Arc<JobQueue>,
        locator: Arc<dyn SourceLocator>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            batches,
            queue,
            locator,
            events,
            recompute_locks: DashMap::new(),
        }
    }

    fn recompute_lock(&self, batch_id: &str) -> Arc<Mutex<()>> {
        self.recompute_locks
            .entry(batch_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn jobs(&self) -> &Arc<dyn JobRepository> {
        self.queue.repository()
    }

    /// Queue a processing job for every track with a resolvable source.
    ///
    /// Input size and options are checked before anything is written. A
    /// track that cannot be queued is reported in `errors` and never aborts
    /// the rest of the batch.
    pub async fn start_batch(
        &self,
        track_ids: &[String],
        user_id: &str,
        options: JobOptions,
    ) -> Result<BatchStart> {
        if track_ids.is_empty() {
            return Err(Error::validation("batch must contain at least one track"));
        }
        if track_ids.len() > MAX_BATCH_SIZE {
            return Err(Error::validation(format!(
                "batch of {} tracks exceeds the maximum of {MAX_BATCH_SIZE}",
                track_ids.len()
            )));
        }
        DemucsModel::from_options(&options).map_err(|e| Error::validation(e.to_string()))?;

        let mut batch = BatchJob::new(user_id, track_ids.len() as u32, options);
        self.batches.create_batch(&batch).await?;
        info!(batch_id = %batch.id, user_id = %user_id, tracks = track_ids.len(), "Starting batch");

        let mut processing_job_ids = Vec::with_capacity(track_ids.len());
        let mut errors = Vec::new();

        for track_id in track_ids {
            match self.queue_track(&batch, track_id).await {
                Ok(job_id) => processing_job_ids.push(job_id),
                Err(reason) => {
                    warn!(batch_id = %batch.id, track_id = %track_id, reason = %reason, "Track not queued");
                    errors.push((track_id.clone(), reason));
                }
            }
        }

        if !processing_job_ids.is_empty() {
            let lock = self.recompute_lock(&batch.id);
            let _guard = lock.lock().await;

            batch.status = BatchStatus::Processing;
            batch.updated_at = chrono::Utc::now();
            self.batches.update_batch(&batch).await?;

            // Jobs that finished while the batch was still pending were
            // skipped by their workers.
            let counts = self.jobs().count_batch_jobs(&batch.id).await?;
            if counts.finished() > 0 {
                batch = self.recompute(&batch.id).await?;
            }
        }

        info!(
            batch_id = %batch.id,
            queued = processing_job_ids.len(),
            failed = errors.len(),
            "Batch started"
        );

        Ok(BatchStart {
            batch,
            processing_job_ids,
            errors,
        })
    }

    async fn queue_track(&self, batch: &BatchJob, track_id: &str) -> std::result::Result<String, String> {
        match self.locator.locate(track_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err("source file not found".to_string()),
            Err(e) => return Err(e.to_string()),
        }

        let job = StageJob::new(StageKind::Processing, track_id, batch.options.clone())
            .with_batch(batch.id.clone());
        self.queue
            .enqueue(job)
            .await
            .map(|job| job.id)
            .map_err(|e| e.to_string())
    }

    /// Recompute `completed_count` and status from the linked processing
    /// jobs and publish the result.
    ///
    /// Failed jobs count as finished. A progress event is published on every
    /// call and a completion event whenever the status is terminal; callers
    /// should stop calling once the batch is terminal.
    pub async fn update_batch_progress(&self, batch_id: &str) -> Result<BatchJob> {
        let lock = self.recompute_lock(batch_id);
        let _guard = lock.lock().await;
        self.recompute(batch_id).await
    }

    /// Recompute a batch that is `processing`. Returns `None` for a batch
    /// that is still being started or already final.
    pub async fn refresh_if_processing(&self, batch_id: &str) -> Result<Option<BatchJob>> {
        let lock = self.recompute_lock(batch_id);
        let _guard = lock.lock().await;

        let batch = self.batches.get_batch(batch_id).await?;
        if batch.status != BatchStatus::Processing {
            debug!(batch_id = %batch_id, status = %batch.status, "Skipping batch update");
            return Ok(None);
        }
        self.recompute(batch_id).await.map(Some)
    }

    /// Caller holds the batch's recompute lock.
    async fn recompute(&self, batch_id: &str) -> Result<BatchJob> {
        let mut batch = self.batches.get_batch(batch_id).await?;
        let counts = self.jobs().count_batch_jobs(batch_id).await?;

        let derived = counts.derive_status();
        // A started batch never drops back to pending.
        if !(derived == BatchStatus::Pending && batch.status == BatchStatus::Processing) {
            batch.status = derived;
        }
        batch.completed_count = counts.finished();
        batch.updated_at = chrono::Utc::now();
        self.batches.update_batch(&batch).await?;

        debug!(
            batch_id = %batch.id,
            status = %batch.status,
            completed = batch.completed_count,
            total = batch.total_count,
            "Batch progress updated"
        );

        let topic = Topic::Batch(batch.id.clone());
        self.events.publish(
            &topic,
            PipelineEvent::BatchProgress {
                batch_id: batch.id.clone(),
                status: batch.status,
                completed_count: batch.completed_count,
                total_count: batch.total_count,
                counts,
            },
        );
        if batch.status.is_terminal() {
            self.recompute_locks.remove(&batch.id);
            info!(batch_id = %batch.id, status = %batch.status, "Batch finished");
            self.events.publish(
                &topic,
                PipelineEvent::BatchCompleted {
                    batch_id: batch.id.clone(),
                    status: batch.status,
                    completed_count: batch.completed_count,
                    total_count: batch.total_count,
                },
            );
        }

        Ok(batch)
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusView> {
        let batch = self.batches.get_batch(batch_id).await?;
        let counts = self.jobs().count_batch_jobs(batch_id).await?;
        Ok(BatchStatusView { batch, counts })
    }

    pub async fn list_batches(&self, user_id: &str) -> Result<Vec<BatchJob>> {
        self.batches.list_batches_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryStore;
    use crate::domain::RetryPolicy;
    use crate::domain::options::OPT_MODEL;
    use crate::events::BroadcastEventBus;
    use crate::source::StaticSourceLocator;

    struct Fixture {
        store: Arc<MemoryStore>,
        orchestrator: BatchOrchestrator,
        _dir: tempfile::TempDir,
    }

    fn fixture(with_source: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut locator = StaticSourceLocator::new();
        for track in with_source {
            let path = dir.path().join(format!("{track}.mp3"));
            std::fs::write(&path, b"audio").unwrap();
            locator.insert(*track, path);
        }

        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), RetryPolicy::default()));
        let orchestrator = BatchOrchestrator::new(
            store.clone(),
            queue,
            Arc::new(locator),
            Arc::new(BroadcastEventBus::new()),
        );
        Fixture {
            store,
            orchestrator,
            _dir: dir,
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("track-{i}")).collect()
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized() {
        let f = fixture(&[]);
        assert!(matches!(
            f.orchestrator.start_batch(&[], "user", JobOptions::new()).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            f.orchestrator
                .start_batch(&ids(MAX_BATCH_SIZE + 1), "user", JobOptions::new())
                .await,
            Err(Error::Validation(_))
        ));
        assert!(f.orchestrator.list_batches("user").await.unwrap().is_empty());
        assert_eq!(f.store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_bad_model_before_side_effects() {
        let f = fixture(&["track-0"]);
        let mut options = JobOptions::new();
        options.insert(OPT_MODEL.into(), "nope".into());

        let result = f.orchestrator.start_batch(&ids(1), "user", options).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(f.orchestrator.list_batches("user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_resolvable_tracks_stays_pending() {
        let f = fixture(&[]);
        let start = f
            .orchestrator
            .start_batch(&ids(2), "user", JobOptions::new())
            .await
            .unwrap();

        assert!(start.processing_job_ids.is_empty());
        assert_eq!(start.errors.len(), 2);
        assert_eq!(start.batch.status, BatchStatus::Pending);
        assert_eq!(start.batch.total_count, 2);
    }

    #[tokio::test]
    async fn test_status_view_has_live_counts() {
        let f = fixture(&["track-0", "track-1"]);
        let start = f
            .orchestrator
            .start_batch(&ids(2), "user", JobOptions::new())
            .await
            .unwrap();
        assert_eq!(start.batch.status, BatchStatus::Processing);

        let mut job = f.store.get_job(&start.processing_job_ids[0]).await.unwrap();
        job.mark_active().unwrap();
        f.store.update_job(&job).await.unwrap();

        let view = f.orchestrator.get_batch_status(&start.batch.id).await.unwrap();
        assert_eq!(view.counts.queued, 1);
        assert_eq!(view.counts.active, 1);
        assert_eq!(view.batch.completed_count, 0);

        // A recomputation with nothing finished keeps the batch processing.
        let batch = f.orchestrator.update_batch_progress(&start.batch.id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Processing);
    }

    /// Holds the next `update_batch` call open for a while once armed.
    struct SlowBatches {
        inner: Arc<MemoryStore>,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl BatchRepository for SlowBatches {
        async fn create_batch(&self, batch: &BatchJob) -> Result<()> {
            self.inner.create_batch(batch).await
        }

        async fn get_batch(&self, id: &str) -> Result<BatchJob> {
            self.inner.get_batch(id).await
        }

        async fn update_batch(&self, batch: &BatchJob) -> Result<()> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            self.inner.update_batch(batch).await
        }

        async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>> {
            self.inner.list_batches_for_user(user_id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_recompute_keeps_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut locator = StaticSourceLocator::new();
        for track in ["track-0", "track-1"] {
            let path = dir.path().join(format!("{track}.mp3"));
            std::fs::write(&path, b"audio").unwrap();
            locator.insert(track, path);
        }
        let store = Arc::new(MemoryStore::new());
        let batches = Arc::new(SlowBatches {
            inner: store.clone(),
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        let queue = Arc::new(JobQueue::new(store.clone(), RetryPolicy::default()));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            batches.clone(),
            queue,
            Arc::new(locator),
            Arc::new(BroadcastEventBus::new()),
        ));

        let start = orchestrator
            .start_batch(&ids(2), "user", JobOptions::new())
            .await
            .unwrap();
        let batch_id = start.batch.id.clone();

        let fail = |id: String| {
            let store = store.clone();
            async move {
                let mut job = store.get_job(&id).await.unwrap();
                job.mark_failed("CUDA out of memory");
                store.update_job(&job).await.unwrap();
            }
        };

        // First worker counts one finished job, then stalls on its write.
        fail(start.processing_job_ids[0].clone()).await;
        batches.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            let batch_id = batch_id.clone();
            async move { orchestrator.refresh_if_processing(&batch_id).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Second worker finishes the last job meanwhile.
        fail(start.processing_job_ids[1].clone()).await;
        let second = orchestrator.refresh_if_processing(&batch_id).await.unwrap();
        first.await.unwrap().unwrap();

        let stored = store.get_batch(&batch_id).await.unwrap();
        assert_eq!(stored.status, BatchStatus::Failed);
        assert_eq!(stored.completed_count, 2);
        assert_eq!(second.map(|b| b.status), Some(BatchStatus::Failed));

        // A terminal batch is left alone afterwards.
        assert!(orchestrator.refresh_if_processing(&batch_id).await.unwrap().is_none());
    }
}
