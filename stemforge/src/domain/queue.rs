//! Durable queue entries backing the stage jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::StageKind;

/// Delivery state of a queue entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Ready to be claimed once `scheduled_at` has passed.
    Available,
    /// Claimed by a worker.
    Executing,
    /// Failed transiently, waiting for its backoff to elapse.
    Retryable,
    Completed,
    /// Failed for good, either deterministically or out of attempts.
    Discarded,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Executing => "executing",
            Self::Retryable => "retryable",
            Self::Completed => "completed",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "executing" => Some(Self::Executing),
            "retryable" => Some(Self::Retryable),
            "completed" => Some(Self::Completed),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }

    /// No further delivery will happen.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Discarded)
    }

    /// May be claimed when due.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Available | Self::Retryable)
    }
}

/// One delivery slot for a stage job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub stage: StageKind,
    pub job_id: String,
    pub state: QueueState,
    /// Number of deliveries so far. Incremented on claim.
    pub attempt: u32,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(stage: StageKind, job_id: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stage,
            job_id: job_id.into(),
            state: QueueState::Available,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            scheduled_at: now,
            attempted_at: None,
            completed_at: None,
            last_error: None,
            inserted_at: now,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.scheduled_at <= now
    }

    /// Claim for delivery.
    pub fn mark_executing(&mut self, now: DateTime<Utc>) {
        self.state = QueueState::Executing;
        self.attempt += 1;
        self.attempted_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = QueueState::Completed;
        self.completed_at = Some(now);
    }

    pub fn mark_retryable(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.state = QueueState::Retryable;
        self.scheduled_at = at;
        self.last_error = Some(error.into());
    }

    pub fn mark_discarded(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.state = QueueState::Discarded;
        self.completed_at = Some(now);
        self.last_error = Some(error.into());
    }

    /// Return an orphaned entry to the queue without counting a new attempt.
    pub fn mark_rescued(&mut self, now: DateTime<Utc>) {
        self.state = QueueState::Available;
        self.scheduled_at = now;
    }
}
