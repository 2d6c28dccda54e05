//! Stage jobs and the pipeline they form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::options::JobOptions;

/// The three stages of a track's pipeline, in order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Download,
    Processing,
    Analysis,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [Self::Download, Self::Processing, Self::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Processing => "processing",
            Self::Analysis => "analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "download" => Some(Self::Download),
            "processing" => Some(Self::Processing),
            "analysis" => Some(Self::Analysis),
            _ => None,
        }
    }

    /// Stage chained after a successful job of this stage.
    pub fn next(&self) -> Option<StageKind> {
        match self {
            Self::Download => Some(Self::Processing),
            Self::Processing => Some(Self::Analysis),
            Self::Analysis => None,
        }
    }

    /// Position in the pipeline, starting at 0.
    pub fn ordinal(&self) -> usize {
        match self {
            Self::Download => 0,
            Self::Processing => 1,
            Self::Analysis => 2,
        }
    }
}

/// Status of one stage job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the stage queue.
    Queued,
    /// Claimed by a worker; a runner may be executing.
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A Download, Processing or Analysis job for one track.
///
/// Retries reuse the same record; the attempt counter lives on the queue
/// entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub id: String,
    pub stage: StageKind,
    pub track_id: String,
    pub status: JobStatus,
    /// Only authoritative while `status == Active`.
    pub progress: u8,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub options: JobOptions,
    pub batch_id: Option<String>,
    /// Structured runner result (analysis features, download metadata).
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageJob {
    pub fn new(stage: StageKind, track_id: impl Into<String>, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stage,
            track_id: track_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            output_path: None,
            error: None,
            options,
            batch_id: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    /// Job for the next stage of the same track, inheriting options.
    pub fn successor(&self) -> Option<StageJob> {
        self.stage
            .next()
            .map(|stage| StageJob::new(stage, self.track_id.clone(), self.options.clone()))
    }

    /// `queued -> active`. A redelivered attempt may also re-enter from
    /// `active` after a rescue sweep.
    pub fn mark_active(&mut self) -> crate::Result<()> {
        if self.status.is_terminal() {
            return Err(crate::Error::invalid_transition(self.status, JobStatus::Active));
        }
        let now = Utc::now();
        self.status = JobStatus::Active;
        self.progress = 0;
        self.error = None;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self, output_path: Option<String>, result: Option<Value>) {
        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.output_path = output_path;
        self.result = result;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Return the job to the queue after a transient failure. The error of
    /// the failed attempt stays visible until the next attempt starts.
    pub fn mark_requeued(&mut self, error: Option<String>) {
        self.status = JobStatus::Queued;
        self.error = error;
        self.updated_at = Utc::now();
    }
}

/// Derived pipeline status for a track: the most advanced stage's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub stage: StageKind,
    pub status: JobStatus,
}

impl PipelineStatus {
    /// Pick the most advanced stage among `jobs`, preferring the newest job
    /// when a stage has several.
    pub fn derive<'a>(jobs: impl IntoIterator<Item = &'a StageJob>) -> Option<Self> {
        jobs.into_iter()
            .max_by_key(|job| (job.stage.ordinal(), job.created_at))
            .map(|job| Self {
                stage: job.stage,
                status: job.status,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stage_chain() {
        assert_eq!(StageKind::Download.next(), Some(StageKind::Processing));
        assert_eq!(StageKind::Processing.next(), Some(StageKind::Analysis));
        assert_eq!(StageKind::Analysis.next(), None);
    }

    #[test]
    fn test_stage_strings() {
        for stage in StageKind::ALL {
            assert_eq!(StageKind::parse(stage.as_str()), Some(stage));
            assert_eq!(StageKind::from_str(&stage.to_string()).unwrap(), stage);
        }
        assert_eq!(StageKind::parse("separation"), None);
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!(JobStatus::parse("active"), Some(JobStatus::Active));
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_lifecycle() {
        let mut job = StageJob::new(StageKind::Processing, "track-1", JobOptions::new());
        assert_eq!(job.status, JobStatus::Queued);

        job.mark_active().unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.started_at.is_some());

        job.mark_completed(Some("/stems".into()), None);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        assert!(job.mark_active().is_err());
    }

    #[test]
    fn test_successor_inherits_options() {
        let mut options = JobOptions::new();
        options.insert("model".into(), "htdemucs_ft".into());
        let download = StageJob::new(StageKind::Download, "t", options.clone()).with_batch("b1");

        let processing = download.successor().unwrap();
        assert_eq!(processing.stage, StageKind::Processing);
        assert_eq!(processing.track_id, "t");
        assert_eq!(processing.options, options);
        assert_eq!(processing.batch_id, None);
        assert_ne!(processing.id, download.id);

        let analysis = processing.successor().unwrap();
        assert!(analysis.successor().is_none());
    }

    #[test]
    fn test_pipeline_status_takes_most_advanced_stage() {
        let mut download = StageJob::new(StageKind::Download, "t", JobOptions::new());
        download.mark_completed(Some("/a.mp3".into()), None);
        let mut processing = StageJob::new(StageKind::Processing, "t", JobOptions::new());
        processing.mark_failed("boom");

        let status = PipelineStatus::derive([&download, &processing]).unwrap();
        assert_eq!(status.stage, StageKind::Processing);
        assert_eq!(status.status, JobStatus::Failed);

        assert!(PipelineStatus::derive(std::iter::empty()).is_none());
    }
}
