//! Forwarding of runner progress to the event bus and the job record.

use std::sync::Arc;
use std::time::Duration;

use sidecar::ProgressUpdate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::database::repositories::JobRepository;
use crate::domain::{StageJob, StageKind};
use crate::events::{EventBus, PipelineEvent, Topic};

/// Minimum spacing between progress writes to the job record.
pub const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the runner progress channel. Updates beyond it are dropped.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Publishes every update on the job and pipeline topics and persists
/// throttled snapshots.
pub struct ProgressForwarder {
    job_id: String,
    track_id: String,
    stage: StageKind,
    events: Arc<dyn EventBus>,
    repository: Arc<dyn JobRepository>,
}

impl ProgressForwarder {
    pub fn new(job: &StageJob, events: Arc<dyn EventBus>, repository: Arc<dyn JobRepository>) -> Self {
        Self {
            job_id: job.id.clone(),
            track_id: job.track_id.clone(),
            stage: job.stage,
            events,
            repository,
        }
    }

    /// Run until every sender is dropped. Resolves to the last percentage
    /// seen so the caller can keep it on the final record.
    pub fn spawn(self, rx: mpsc::Receiver<ProgressUpdate>) -> JoinHandle<u8> {
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: mpsc::Receiver<ProgressUpdate>) -> u8 {
        let job_topic = Topic::Job(self.job_id.clone());
        let pipeline_topic = Topic::Pipeline(self.track_id.clone());
        let mut last_percent = 0u8;
        let mut last_flush: Option<Instant> = None;

        while let Some(update) = rx.recv().await {
            last_percent = update.percent;
            let event = PipelineEvent::StageProgress {
                job_id: self.job_id.clone(),
                track_id: self.track_id.clone(),
                stage: self.stage,
                progress: update.percent,
                message: update.message,
            };
            self.events.publish(&job_topic, event.clone());
            self.events.publish(&pipeline_topic, event);

            let due = last_flush.is_none_or(|at| at.elapsed() >= PROGRESS_FLUSH_INTERVAL);
            if due {
                last_flush = Some(Instant::now());
                match self.repository.update_progress(&self.job_id, update.percent).await {
                    Ok(true) => {}
                    Ok(false) => debug!(job_id = %self.job_id, "Progress ignored, job not active"),
                    Err(e) => warn!(job_id = %self.job_id, error = %e, "Failed to persist progress"),
                }
            }
        }

        last_percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryStore;
    use crate::domain::{JobOptions, QueueEntry};
    use crate::events::{BroadcastEventBus, TopicEvent};

    #[tokio::test]
    async fn test_forwards_to_both_topics_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let bus = BroadcastEventBus::new();
        let mut events = bus.subscribe();

        let mut job = StageJob::new(StageKind::Processing, "track-1", JobOptions::new());
        job.mark_active().unwrap();
        let entry = QueueEntry::new(job.stage, job.id.clone(), 3);
        store.insert_job(&job, &entry).await.unwrap();

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let handle = ProgressForwarder::new(&job, Arc::new(bus.clone()), store.clone()).spawn(rx);

        tx.send(ProgressUpdate::new(10, Some("loading".into()))).await.unwrap();
        tx.send(ProgressUpdate::new(40, None)).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), 40);

        let mut received: Vec<TopicEvent> = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(received[0].topic, Topic::Job(job.id.clone()));
        assert_eq!(received[1].topic, Topic::Pipeline("track-1".into()));
        assert_eq!(received[3].event.progress(), 40);

        // The first update is always written; the second falls inside the
        // throttle window.
        let stored = store.get_job(&job.id).await.unwrap();
        assert_eq!(stored.progress, 10);
    }
}
