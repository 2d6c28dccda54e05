//! Stage processor trait and related types.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use sidecar::ProgressUpdate;
use tokio::sync::mpsc;

use crate::domain::{Stem, StageJob, StageKind};
use crate::error::StageError;

/// Input handed to a processor for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job: StageJob,
    /// Resolved audio file. Always set for stages that need a source.
    pub source: Option<PathBuf>,
    /// Progress reported by the runner. Sends never block.
    pub progress: mpsc::Sender<ProgressUpdate>,
}

impl StageContext {
    /// The resolved source, or `FileNotFound` when the worker had none.
    pub fn require_source(&self) -> Result<&PathBuf, StageError> {
        self.source.as_ref().ok_or_else(|| StageError::FileNotFound {
            track_id: self.job.track_id.clone(),
        })
    }
}

/// Output of a successful attempt.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub output_path: Option<String>,
    /// Structured runner result stored on the job.
    pub result: Option<Value>,
    /// Derived records written alongside the completed job.
    pub stems: Vec<Stem>,
}

/// One pipeline stage backed by a runner script.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> StageKind;

    fn name(&self) -> &'static str;

    /// Whether the worker must resolve the track's audio file first.
    fn needs_source(&self) -> bool {
        true
    }

    /// Check the job's options without side effects.
    fn validate(&self, job: &StageJob) -> Result<(), StageError>;

    /// Run the stage.
    ///
    /// # Cancel Safety
    ///
    /// Dropping the future kills the runner process. A partially written
    /// output directory may be left behind and is overwritten on retry.
    async fn process(&self, ctx: StageContext) -> Result<StageOutput, StageError>;
}
