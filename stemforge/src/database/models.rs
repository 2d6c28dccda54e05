//! Row models and their conversion to domain types.
//!
//! Enums are stored as lowercase text, JSON maps as text, and timestamps as
//! epoch milliseconds.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{
    BatchJob, BatchStatus, JobOptions, JobStatus, QueueEntry, QueueState, StageJob, StageKind,
    Stem, StemType,
};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StageJobRow {
    pub id: String,
    pub stage: String,
    pub track_id: String,
    pub status: String,
    pub progress: i64,
    pub output_path: Option<String>,
    pub error: Option<String>,
    /// JSON object
    pub options: String,
    pub batch_id: Option<String>,
    /// JSON value
    pub result: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntryRow {
    pub id: String,
    pub stage: String,
    pub job_id: String,
    pub state: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub scheduled_at: i64,
    pub attempted_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_error: Option<String>,
    pub inserted_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchJobRow {
    pub id: String,
    pub user_id: String,
    pub total_count: i64,
    pub completed_count: i64,
    pub status: String,
    pub options: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StemRow {
    pub id: String,
    pub processing_job_id: String,
    pub track_id: String,
    pub stem_type: String,
    pub file_path: String,
    pub file_size: i64,
    pub created_at: i64,
}

fn invalid(column: &str, value: &str) -> Error {
    Error::Database(format!("invalid {column} value '{value}'"))
}

fn parse_options(raw: &str) -> Result<JobOptions> {
    if raw.is_empty() {
        return Ok(JobOptions::new());
    }
    Ok(serde_json::from_str(raw)?)
}

impl TryFrom<StageJobRow> for StageJob {
    type Error = Error;

    fn try_from(row: StageJobRow) -> Result<Self> {
        Ok(StageJob {
            stage: StageKind::parse(&row.stage).ok_or_else(|| invalid("stage", &row.stage))?,
            status: JobStatus::parse(&row.status).ok_or_else(|| invalid("status", &row.status))?,
            progress: row.progress.clamp(0, 100) as u8,
            options: parse_options(&row.options)?,
            result: row
                .result
                .as_deref()
                .map(serde_json::from_str::<serde_json::Value>)
                .transpose()?,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            started_at: opt_ms_to_datetime(row.started_at),
            completed_at: opt_ms_to_datetime(row.completed_at),
            id: row.id,
            track_id: row.track_id,
            output_path: row.output_path,
            error: row.error,
            batch_id: row.batch_id,
        })
    }
}

impl TryFrom<&StageJob> for StageJobRow {
    type Error = Error;

    fn try_from(job: &StageJob) -> Result<Self> {
        Ok(StageJobRow {
            id: job.id.clone(),
            stage: job.stage.as_str().to_string(),
            track_id: job.track_id.clone(),
            status: job.status.as_str().to_string(),
            progress: i64::from(job.progress),
            output_path: job.output_path.clone(),
            error: job.error.clone(),
            options: serde_json::to_string(&job.options)?,
            batch_id: job.batch_id.clone(),
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            created_at: datetime_to_ms(job.created_at),
            updated_at: datetime_to_ms(job.updated_at),
            started_at: opt_datetime_to_ms(job.started_at),
            completed_at: opt_datetime_to_ms(job.completed_at),
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = Error;

    fn try_from(row: QueueEntryRow) -> Result<Self> {
        Ok(QueueEntry {
            stage: StageKind::parse(&row.stage).ok_or_else(|| invalid("stage", &row.stage))?,
            state: QueueState::parse(&row.state).ok_or_else(|| invalid("state", &row.state))?,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_at: ms_to_datetime(row.scheduled_at),
            attempted_at: opt_ms_to_datetime(row.attempted_at),
            completed_at: opt_ms_to_datetime(row.completed_at),
            inserted_at: ms_to_datetime(row.inserted_at),
            id: row.id,
            job_id: row.job_id,
            last_error: row.last_error,
        })
    }
}

impl From<&QueueEntry> for QueueEntryRow {
    fn from(entry: &QueueEntry) -> Self {
        QueueEntryRow {
            id: entry.id.clone(),
            stage: entry.stage.as_str().to_string(),
            job_id: entry.job_id.clone(),
            state: entry.state.as_str().to_string(),
            attempt: i64::from(entry.attempt),
            max_attempts: i64::from(entry.max_attempts),
            scheduled_at: datetime_to_ms(entry.scheduled_at),
            attempted_at: opt_datetime_to_ms(entry.attempted_at),
            completed_at: opt_datetime_to_ms(entry.completed_at),
            last_error: entry.last_error.clone(),
            inserted_at: datetime_to_ms(entry.inserted_at),
        }
    }
}

impl TryFrom<BatchJobRow> for BatchJob {
    type Error = Error;

    fn try_from(row: BatchJobRow) -> Result<Self> {
        Ok(BatchJob {
            status: BatchStatus::parse(&row.status)
                .ok_or_else(|| invalid("status", &row.status))?,
            total_count: row.total_count.max(0) as u32,
            completed_count: row.completed_count.max(0) as u32,
            options: parse_options(&row.options)?,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
            id: row.id,
            user_id: row.user_id,
        })
    }
}

impl TryFrom<&BatchJob> for BatchJobRow {
    type Error = Error;

    fn try_from(batch: &BatchJob) -> Result<Self> {
        Ok(BatchJobRow {
            id: batch.id.clone(),
            user_id: batch.user_id.clone(),
            total_count: i64::from(batch.total_count),
            completed_count: i64::from(batch.completed_count),
            status: batch.status.as_str().to_string(),
            options: serde_json::to_string(&batch.options)?,
            created_at: datetime_to_ms(batch.created_at),
            updated_at: datetime_to_ms(batch.updated_at),
        })
    }
}

impl TryFrom<StemRow> for Stem {
    type Error = Error;

    fn try_from(row: StemRow) -> Result<Self> {
        Ok(Stem {
            stem_type: row
                .stem_type
                .parse::<StemType>()
                .map_err(|_| invalid("stem_type", &row.stem_type))?,
            file_size: row.file_size.max(0) as u64,
            created_at: ms_to_datetime(row.created_at),
            id: row.id,
            processing_job_id: row.processing_job_id,
            track_id: row.track_id,
            file_path: row.file_path,
        })
    }
}

impl From<&Stem> for StemRow {
    fn from(stem: &Stem) -> Self {
        StemRow {
            id: stem.id.clone(),
            processing_job_id: stem.processing_job_id.clone(),
            track_id: stem.track_id.clone(),
            stem_type: stem.stem_type.as_str().to_string(),
            file_path: stem.file_path.clone(),
            file_size: stem.file_size as i64,
            created_at: datetime_to_ms(stem.created_at),
        }
    }
}
