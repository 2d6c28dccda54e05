//! Pipeline Manager: owns the queue, the per-stage pools and the sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde_json::Value;
use sidecar::{ChannelSupervisor, ScriptLocator, SupervisorStats};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::job_queue::JobQueue;
use super::processors::StageProcessors;
use super::purge::JobPurgeService;
use super::rescue::RescueService;
use super::worker::StageWorker;
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::batch::{BatchOrchestrator, BatchStart};
use crate::config::AppConfig;
use crate::database::repositories::{JobRepository, Repositories, StemRepository};
use crate::domain::options::OPT_URL;
use crate::domain::{JobOptions, PipelineStatus, SpotifyTrackUrl, StageJob, StageKind, Stem};
use crate::error::StageError;
use crate::events::EventBus;
use crate::source::{DownloadedSourceLocator, SourceLocator};
use crate::{Error, Result};

/// One value per stage, looked up with an exhaustive match.
struct PerStage<T> {
    download: T,
    processing: T,
    analysis: T,
}

impl<T> PerStage<T> {
    fn build(mut f: impl FnMut(StageKind) -> T) -> Self {
        Self {
            download: f(StageKind::Download),
            processing: f(StageKind::Processing),
            analysis: f(StageKind::Analysis),
        }
    }

    fn get(&self, stage: StageKind) -> &T {
        match stage {
            StageKind::Download => &self.download,
            StageKind::Processing => &self.processing,
            StageKind::Analysis => &self.analysis,
        }
    }
}

/// Snapshot of one stage's pool and queue.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StageStats {
    pub stage: StageKind,
    pub max_workers: usize,
    pub active_workers: usize,
    pub ready: u64,
}

pub struct PipelineManager {
    config: AppConfig,
    queue: Arc<JobQueue>,
    stems: Arc<dyn StemRepository>,
    supervisor: ChannelSupervisor,
    processors: StageProcessors,
    batches: Arc<BatchOrchestrator>,
    workers: PerStage<Arc<StageWorker>>,
    pools: PerStage<WorkerPool>,
    rescue: Arc<RescueService>,
    purge: Arc<JobPurgeService>,
    cancellation_token: CancellationToken,
    started: AtomicBool,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    /// Sources are the output of each track's completed download.
    pub fn new(config: AppConfig, repositories: Repositories, events: Arc<dyn EventBus>) -> Self {
        let locator = Arc::new(DownloadedSourceLocator::new(repositories.jobs.clone()));
        Self::with_locator(config, repositories, events, locator)
    }

    pub fn with_locator(
        config: AppConfig,
        repositories: Repositories,
        events: Arc<dyn EventBus>,
        locator: Arc<dyn SourceLocator>,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let supervisor = ChannelSupervisor::with_cancellation(
            ScriptLocator::new(&config.sidecar.runtime, &config.sidecar.scripts_dir),
            cancellation_token.child_token(),
        );
        let processors = StageProcessors::new(supervisor.clone(), &config.sidecar, &config.storage);

        let queue = Arc::new(JobQueue::new(repositories.jobs.clone(), config.retry.clone()));
        let batches = Arc::new(BatchOrchestrator::new(
            repositories.batches.clone(),
            queue.clone(),
            locator.clone(),
            events.clone(),
        ));

        let workers = PerStage::build(|stage| {
            Arc::new(
                StageWorker::new(
                    processors.get(stage),
                    queue.clone(),
                    locator.clone(),
                    repositories.stems.clone(),
                    events.clone(),
                )
                .with_batches(batches.clone()),
            )
        });
        let pools = PerStage::build(|stage| {
            WorkerPool::with_config(
                stage,
                WorkerPoolConfig {
                    max_workers: config.workers.concurrency_for(stage),
                    job_timeout_secs: config.sidecar.timeout_for(stage).as_secs(),
                    poll_interval_ms: config.workers.poll_interval_ms,
                },
            )
        });

        let rescue = Arc::new(
            RescueService::new(config.rescue.clone(), queue.clone()).with_batches(batches.clone()),
        );
        let purge = Arc::new(JobPurgeService::new(
            config.purge.clone(),
            repositories.jobs.clone(),
        ));

        Self {
            config,
            queue,
            stems: repositories.stems,
            supervisor,
            processors,
            batches,
            workers,
            pools,
            rescue,
            purge,
            cancellation_token,
            started: AtomicBool::new(false),
            background: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Start the worker pools and the rescue and purge sweeps.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Pipeline Manager already started");
            return;
        }
        info!("Starting Pipeline Manager");

        for stage in StageKind::ALL {
            let worker = self.workers.get(stage).clone();
            info!(
                "Starting {} pool with processor {}",
                stage,
                worker.processor_name()
            );
            self.pools
                .get(stage)
                .start(worker, self.queue.notifier(stage));
        }

        let mut background = self.background.lock();
        background.push(
            self.rescue
                .clone()
                .start_background_task(self.cancellation_token.child_token()),
        );
        background.push(
            self.purge
                .clone()
                .start_background_task(self.cancellation_token.child_token()),
        );

        info!("Pipeline Manager started");
    }

    /// Cancel in-flight runner calls, then wait for the pools and sweeps.
    ///
    /// Jobs interrupted by the shutdown are handed back to the queue without
    /// losing an attempt.
    pub async fn stop(&self) {
        info!("Stopping Pipeline Manager");
        self.cancellation_token.cancel();
        self.supervisor.shutdown();

        join_all(StageKind::ALL.map(|stage| self.pools.get(stage).stop())).await;

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        join_all(handles).await;

        info!("Pipeline Manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancellation_token.is_cancelled()
    }

    /// Start a track's pipeline from a media URL. Returns the download job id.
    pub async fn submit(&self, track_id: &str, url: &str, mut options: JobOptions) -> Result<String> {
        SpotifyTrackUrl::parse(url).map_err(stage_to_validation)?;
        options.insert(OPT_URL.to_string(), Value::String(url.trim().to_string()));

        let job = self
            .enqueue_stage(StageKind::Download, track_id, options, None)
            .await?;
        Ok(job.id)
    }

    /// Queue a job for any stage, checking its options first.
    pub async fn enqueue_stage(
        &self,
        stage: StageKind,
        track_id: &str,
        options: JobOptions,
        batch_id: Option<String>,
    ) -> Result<StageJob> {
        if track_id.trim().is_empty() {
            return Err(Error::validation("track id must not be empty"));
        }

        let mut job = StageJob::new(stage, track_id, options);
        job.batch_id = batch_id;
        self.processors
            .get(stage)
            .validate(&job)
            .map_err(stage_to_validation)?;

        self.queue.enqueue(job).await
    }

    /// Fan a batch of tracks out into processing jobs.
    pub async fn start_batch(
        &self,
        track_ids: &[String],
        user_id: &str,
        options: JobOptions,
    ) -> Result<BatchStart> {
        self.batches.start_batch(track_ids, user_id, options).await
    }

    /// Status of the most advanced stage for a track.
    pub async fn pipeline_status(&self, track_id: &str) -> Result<Option<PipelineStatus>> {
        let jobs = self.jobs().list_jobs_for_track(track_id).await?;
        Ok(PipelineStatus::derive(&jobs))
    }

    pub async fn jobs_for_track(&self, track_id: &str) -> Result<Vec<StageJob>> {
        self.jobs().list_jobs_for_track(track_id).await
    }

    pub async fn stems_for_track(&self, track_id: &str) -> Result<Vec<Stem>> {
        self.stems.list_stems_for_track(track_id).await
    }

    pub async fn get_job(&self, id: &str) -> Result<StageJob> {
        self.jobs().get_job(id).await
    }

    /// The worker of `stage`, for ticking it directly.
    pub fn worker(&self, stage: StageKind) -> Arc<StageWorker> {
        self.workers.get(stage).clone()
    }

    pub fn batches(&self) -> &Arc<BatchOrchestrator> {
        &self.batches
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn rescue_service(&self) -> &Arc<RescueService> {
        &self.rescue
    }

    pub fn purge_service(&self) -> &Arc<JobPurgeService> {
        &self.purge
    }

    pub fn supervisor_stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    pub async fn stage_stats(&self) -> Result<Vec<StageStats>> {
        let mut stats = Vec::with_capacity(StageKind::ALL.len());
        for stage in StageKind::ALL {
            let pool = self.pools.get(stage);
            stats.push(StageStats {
                stage,
                max_workers: pool.max_workers(),
                active_workers: pool.active_count(),
                ready: self.queue.depth(stage).await?,
            });
        }
        Ok(stats)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn jobs(&self) -> &Arc<dyn JobRepository> {
        self.queue.repository()
    }
}

fn stage_to_validation(err: StageError) -> Error {
    match err {
        StageError::Validation(msg) => Error::Validation(msg),
        StageError::Configuration(msg) => Error::Configuration(msg),
        other => Error::validation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryStore;
    use crate::domain::JobStatus;
    use crate::events::BroadcastEventBus;

    fn manager() -> PipelineManager {
        PipelineManager::new(
            AppConfig::default(),
            Repositories::memory(Arc::new(MemoryStore::new())),
            Arc::new(BroadcastEventBus::new()),
        )
    }

    #[tokio::test]
    async fn test_submit_validates_url() {
        let manager = manager();
        assert!(matches!(
            manager
                .submit("track-1", "https://example.com/song.mp3", JobOptions::new())
                .await,
            Err(Error::Validation(_))
        ));

        let job_id = manager
            .submit(
                "track-1",
                "https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC",
                JobOptions::new(),
            )
            .await
            .unwrap();
        let job = manager.get_job(&job_id).await.unwrap();
        assert_eq!(job.stage, StageKind::Download);
        assert_eq!(job.status, JobStatus::Queued);

        let status = manager.pipeline_status("track-1").await.unwrap().unwrap();
        assert_eq!(status.stage, StageKind::Download);
        assert_eq!(status.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_enqueue_stage_rejects_bad_options() {
        let manager = manager();
        let mut options = JobOptions::new();
        options.insert("features".into(), "tempo,nonsense".into());

        let result = manager
            .enqueue_stage(StageKind::Analysis, "track-1", options, None)
            .await;
        assert!(matches!(result, Err(Error::Validation(msg)) if msg.contains("nonsense")));
        assert!(manager.jobs_for_track("track-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = manager();
        manager.start();
        assert!(manager.is_running());

        let stats = manager.stage_stats().await.unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].max_workers, 3);

        manager.stop().await;
        assert!(!manager.is_running());
    }
}
