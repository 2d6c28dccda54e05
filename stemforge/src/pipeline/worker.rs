//! Stage worker: one claim-run-record cycle per tick.
//!
//! A tick claims one job of the worker's stage, persists it as active,
//! resolves its source file, runs the stage processor and records the
//! outcome. Successful Download and Processing jobs enqueue the next stage;
//! failures never do.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::job_queue::{ClaimedJob, JobQueue, RetryDecision};
use super::processors::{StageContext, StageOutput, StageProcessor};
use super::progress::{PROGRESS_CHANNEL_CAPACITY, ProgressForwarder};
use crate::Result;
use crate::batch::BatchOrchestrator;
use crate::database::repositories::StemRepository;
use crate::domain::{QueueEntry, StageJob, StageKind};
use crate::error::StageError;
use crate::events::{EventBus, PipelineEvent, Topic};
use crate::source::SourceLocator;

/// What one tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub job_id: String,
    pub track_id: String,
    pub stage: StageKind,
    pub attempt: u32,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed {
        /// Job id of the next stage, when one was enqueued.
        successor: Option<String>,
    },
    Failed {
        error: String,
        kind: &'static str,
        will_retry: bool,
    },
    /// Handed back to the queue during shutdown.
    Released,
}

pub struct StageWorker {
    stage: StageKind,
    queue: Arc<JobQueue>,
    processor: Arc<dyn StageProcessor>,
    locator: Arc<dyn SourceLocator>,
    stems: Arc<dyn StemRepository>,
    events: Arc<dyn EventBus>,
    batches: Option<Arc<BatchOrchestrator>>,
}

impl StageWorker {
    pub fn new(
        processor: Arc<dyn StageProcessor>,
        queue: Arc<JobQueue>,
        locator: Arc<dyn SourceLocator>,
        stems: Arc<dyn StemRepository>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            stage: processor.stage(),
            queue,
            processor,
            locator,
            stems,
            events,
            batches: None,
        }
    }

    /// Recompute batch progress when batch-linked jobs finish.
    pub fn with_batches(mut self, batches: Arc<BatchOrchestrator>) -> Self {
        self.batches = Some(batches);
        self
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn processor_name(&self) -> &'static str {
        self.processor.name()
    }

    /// Process at most one job. `Ok(None)` means the queue had nothing due.
    pub async fn tick(&self) -> Result<Option<TickReport>> {
        let Some(ClaimedJob { mut entry, mut job }) = self.queue.claim(self.stage).await? else {
            return Ok(None);
        };

        if let Err(e) = job.mark_active() {
            // A finished job delivered again has nothing left to do.
            warn!(job_id = %job.id, error = %e, "Claimed job is already final");
            self.queue.complete(&mut entry).await?;
            return Ok(None);
        }

        // Durable before visible.
        let repository = self.queue.repository().clone();
        if let Err(e) = repository.update_job(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to persist active status");
            self.queue
                .fail(&mut entry, &StageError::Persistence(e.to_string()))
                .await?;
            return Err(e);
        }

        if entry.attempt > 1 {
            info!(job_id = %job.id, attempt = entry.attempt, "Retrying stage job");
        }
        debug!(
            job_id = %job.id,
            track_id = %job.track_id,
            processor = self.processor.name(),
            "Stage job active"
        );
        self.publish(
            &job,
            PipelineEvent::StageStarted {
                job_id: job.id.clone(),
                track_id: job.track_id.clone(),
                stage: job.stage,
                attempt: entry.attempt,
            },
        );

        let (result, last_progress) = self.run(&job).await;
        let attempt = entry.attempt;
        let outcome = match result {
            Ok(output) => self.record_success(&mut entry, &mut job, output).await?,
            Err(err) => {
                job.progress = last_progress.max(job.progress);
                self.record_failure(&mut entry, &mut job, err).await?
            }
        };

        Ok(Some(TickReport {
            job_id: job.id,
            track_id: job.track_id,
            stage: job.stage,
            attempt,
            outcome,
        }))
    }

    /// Validate, resolve the source and run the processor with progress
    /// forwarding. Returns the last progress seen alongside the result.
    async fn run(&self, job: &StageJob) -> (std::result::Result<StageOutput, StageError>, u8) {
        if let Err(e) = self.processor.validate(job) {
            return (Err(e), 0);
        }

        let source = if self.processor.needs_source() {
            match self.locator.locate(&job.track_id).await {
                Ok(Some(path)) => Some(path),
                Ok(None) => {
                    return (
                        Err(StageError::FileNotFound {
                            track_id: job.track_id.clone(),
                        }),
                        0,
                    );
                }
                Err(e) => return (Err(e.into()), 0),
            }
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let forwarder =
            ProgressForwarder::new(job, self.events.clone(), self.queue.repository().clone())
                .spawn(rx);

        let result = self
            .processor
            .process(StageContext {
                job: job.clone(),
                source,
                progress: tx,
            })
            .await;

        // Every sender is gone once process() returns, so this drains the
        // remaining updates and finishes.
        let last_progress = forwarder.await.unwrap_or_else(|e| {
            warn!(job_id = %job.id, error = %e, "Progress forwarder failed");
            0
        });

        (result, last_progress)
    }

    async fn record_success(
        &self,
        entry: &mut QueueEntry,
        job: &mut StageJob,
        output: StageOutput,
    ) -> Result<TickOutcome> {
        // Derived records first so a completed job always has its stems.
        if !output.stems.is_empty()
            && let Err(e) = self.stems.create_stems(&output.stems).await
        {
            error!(job_id = %job.id, error = %e, "Failed to store stems");
            return self
                .record_failure(entry, job, StageError::Persistence(e.to_string()))
                .await;
        }

        job.mark_completed(output.output_path, output.result);
        self.queue.repository().update_job(job).await?;
        self.queue.complete(entry).await?;

        info!(
            job_id = %job.id,
            track_id = %job.track_id,
            stage = %job.stage,
            stems = output.stems.len(),
            "Stage job completed"
        );
        self.publish(
            job,
            PipelineEvent::StageCompleted {
                job_id: job.id.clone(),
                track_id: job.track_id.clone(),
                stage: job.stage,
                output_path: job.output_path.clone(),
            },
        );

        let successor = match job.successor() {
            Some(next) => match self.queue.enqueue(next).await {
                Ok(next) => {
                    debug!(job_id = %job.id, next_job_id = %next.id, stage = %next.stage, "Chained next stage");
                    Some(next.id)
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to enqueue next stage");
                    None
                }
            },
            None => None,
        };

        self.after_final(job).await;
        Ok(TickOutcome::Completed { successor })
    }

    async fn record_failure(
        &self,
        entry: &mut QueueEntry,
        job: &mut StageJob,
        err: StageError,
    ) -> Result<TickOutcome> {
        let decision = self.queue.fail(entry, &err).await?;
        let message = err.to_string();

        match decision {
            RetryDecision::Released => {
                job.mark_requeued(None);
                self.queue.repository().update_job(job).await?;
                info!(job_id = %job.id, "Stage job released during shutdown");
                return Ok(TickOutcome::Released);
            }
            RetryDecision::RetryAt(_) => job.mark_requeued(Some(message.clone())),
            RetryDecision::Discarded => job.mark_failed(message.clone()),
        }
        self.queue.repository().update_job(job).await?;

        let will_retry = decision.will_retry();
        warn!(
            job_id = %job.id,
            track_id = %job.track_id,
            stage = %job.stage,
            kind = err.kind(),
            will_retry,
            error = %message,
            "Stage job failed"
        );
        self.publish(
            job,
            PipelineEvent::StageFailed {
                job_id: job.id.clone(),
                track_id: job.track_id.clone(),
                stage: job.stage,
                progress: job.progress,
                error: message.clone(),
                will_retry,
            },
        );

        if !will_retry {
            self.after_final(job).await;
        }
        Ok(TickOutcome::Failed {
            error: message,
            kind: err.kind(),
            will_retry,
        })
    }

    /// Batch hook for a job that will not be delivered again.
    async fn after_final(&self, job: &StageJob) {
        let (Some(batches), Some(batch_id)) = (&self.batches, &job.batch_id) else {
            return;
        };
        if job.stage != StageKind::Processing {
            return;
        }
        notify_batch(batches, batch_id).await;
    }

    fn publish(&self, job: &StageJob, event: PipelineEvent) {
        self.events.publish(&Topic::Job(job.id.clone()), event.clone());
        self.events
            .publish(&Topic::Pipeline(job.track_id.clone()), event);
    }
}

/// Recompute a batch unless it is still being started or already final.
pub(crate) async fn notify_batch(batches: &BatchOrchestrator, batch_id: &str) {
    if let Err(e) = batches.refresh_if_processing(batch_id).await {
        warn!(batch_id = %batch_id, error = %e, "Failed to update batch progress");
    }
}
