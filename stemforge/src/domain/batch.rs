//! Batch jobs: one user action fanned out into many processing jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::JobOptions;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Batch header. `completed_count` is always recomputed from the linked
/// processing jobs, never incremented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub user_id: String,
    pub total_count: u32,
    pub completed_count: u32,
    pub status: BatchStatus,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(user_id: impl Into<String>, total_count: u32, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            total_count,
            completed_count: 0,
            status: BatchStatus::Pending,
            options,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Processing jobs of one batch, counted by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub queued: u32,
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchCounts {
    /// Jobs in a terminal state, successful or not.
    pub fn finished(&self) -> u32 {
        self.completed + self.failed
    }

    pub fn total(&self) -> u32 {
        self.queued + self.active + self.completed + self.failed
    }

    /// Status implied by these counts.
    ///
    /// Every finished job counts toward completion whether it succeeded or
    /// not; a batch where nothing succeeded is `failed`.
    pub fn derive_status(&self) -> BatchStatus {
        let finished = self.finished();
        if finished > 0 && finished == self.total() {
            if self.completed == 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            }
        } else if finished > 0 {
            BatchStatus::Processing
        } else {
            BatchStatus::Pending
        }
    }
}
