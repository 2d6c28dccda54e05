//! Resolution of a track's local audio file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::database::repositories::JobRepository;
use crate::domain::{JobStatus, StageKind};

/// Resolves a track id to a readable audio file.
#[async_trait]
pub trait SourceLocator: Send + Sync {
    /// `Ok(None)` when the track has no usable file.
    async fn locate(&self, track_id: &str) -> Result<Option<PathBuf>>;
}

/// Uses the output of the track's most recent completed download.
pub struct DownloadedSourceLocator {
    jobs: Arc<dyn JobRepository>,
}

impl DownloadedSourceLocator {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl SourceLocator for DownloadedSourceLocator {
    async fn locate(&self, track_id: &str) -> Result<Option<PathBuf>> {
        let jobs = self.jobs.list_jobs_for_track(track_id).await?;
        let path = jobs
            .iter()
            .rev()
            .filter(|job| job.stage == StageKind::Download && job.status == JobStatus::Completed)
            .find_map(|job| job.output_path.as_deref())
            .map(PathBuf::from);

        Ok(path.filter(|p| p.is_file()))
    }
}

/// Fixed mapping for libraries whose files already exist on disk.
#[derive(Debug, Clone, Default)]
pub struct StaticSourceLocator {
    paths: HashMap<String, PathBuf>,
}

impl StaticSourceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, track_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.insert(track_id, path);
        self
    }

    pub fn insert(&mut self, track_id: impl Into<String>, path: impl Into<PathBuf>) {
        self.paths.insert(track_id.into(), path.into());
    }
}

#[async_trait]
impl SourceLocator for StaticSourceLocator {
    async fn locate(&self, track_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.paths.get(track_id).filter(|p| p.is_file()).cloned())
    }
}
