//! Pipeline events and the bus they are published on.
//!
//! Publishing is fire-and-forget: events are dropped when nobody listens and
//! slow subscribers lag rather than block publishers.

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{BatchCounts, BatchStatus, JobStatus, StageKind};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Topic an event is published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// Updates for one stage job.
    Job(String),
    /// Updates for every stage of one track.
    Pipeline(String),
    Batch(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{id}"),
            Self::Pipeline(track_id) => write!(f, "pipeline:{track_id}"),
            Self::Batch(id) => write!(f, "batch:{id}"),
        }
    }
}

/// Event payloads. Each one can be reduced to a `{status, progress}` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        job_id: String,
        track_id: String,
        stage: StageKind,
        attempt: u32,
    },
    StageProgress {
        job_id: String,
        track_id: String,
        stage: StageKind,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StageCompleted {
        job_id: String,
        track_id: String,
        stage: StageKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_path: Option<String>,
    },
    StageFailed {
        job_id: String,
        track_id: String,
        stage: StageKind,
        progress: u8,
        error: String,
        /// Whether the queue will deliver the job again.
        will_retry: bool,
    },
    BatchProgress {
        batch_id: String,
        status: BatchStatus,
        completed_count: u32,
        total_count: u32,
        counts: BatchCounts,
    },
    BatchCompleted {
        batch_id: String,
        status: BatchStatus,
        completed_count: u32,
        total_count: u32,
    },
}

impl PipelineEvent {
    pub fn status(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } | Self::StageProgress { .. } => JobStatus::Active.as_str(),
            Self::StageCompleted { .. } => JobStatus::Completed.as_str(),
            Self::StageFailed {
                will_retry: true, ..
            } => JobStatus::Queued.as_str(),
            Self::StageFailed { .. } => JobStatus::Failed.as_str(),
            Self::BatchProgress { status, .. } | Self::BatchCompleted { status, .. } => {
                status.as_str()
            }
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            Self::StageStarted { .. } => 0,
            Self::StageProgress { progress, .. } | Self::StageFailed { progress, .. } => *progress,
            Self::StageCompleted { .. } => 100,
            Self::BatchProgress {
                completed_count,
                total_count,
                ..
            }
            | Self::BatchCompleted {
                completed_count,
                total_count,
                ..
            } => percent(*completed_count, *total_count),
        }
    }
}

fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((u64::from(done.min(total)) * 100) / u64::from(total)) as u8
}

/// Publish/subscribe capability consumed by workers and the batch
/// orchestrator.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &Topic, event: PipelineEvent);
}

/// Message delivered to broadcast subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub topic: Topic,
    pub event: PipelineEvent,
}

/// In-process bus over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<TopicEvent>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, topic: &Topic, event: PipelineEvent) {
        tracing::trace!(topic = %topic, status = event.status(), "Publishing event");
        // send() fails only when there are no receivers
        let _ = self.sender.send(TopicEvent {
            topic: topic.clone(),
            event,
        });
    }
}
