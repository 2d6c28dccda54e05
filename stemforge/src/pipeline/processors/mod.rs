//! Stage processors: Download, Processing (separation) and Analysis.

pub mod analysis;
pub mod download;
pub mod separation;
pub mod traits;

pub use analysis::AnalysisProcessor;
pub use download::DownloadProcessor;
pub use separation::SeparationProcessor;
pub use traits::{StageContext, StageOutput, StageProcessor};

use std::sync::Arc;

use sidecar::ChannelSupervisor;

use crate::config::{SidecarConfig, StorageConfig};
use crate::domain::StageKind;

/// One processor per stage.
#[derive(Clone)]
pub struct StageProcessors {
    pub download: Arc<dyn StageProcessor>,
    pub processing: Arc<dyn StageProcessor>,
    pub analysis: Arc<dyn StageProcessor>,
}

impl StageProcessors {
    /// The runner-backed processors.
    pub fn new(supervisor: ChannelSupervisor, sidecar: &SidecarConfig, storage: &StorageConfig) -> Self {
        Self {
            download: Arc::new(DownloadProcessor::new(
                supervisor.clone(),
                sidecar.clone(),
                storage.clone(),
            )),
            processing: Arc::new(SeparationProcessor::new(
                supervisor.clone(),
                sidecar.clone(),
                storage.clone(),
            )),
            analysis: Arc::new(AnalysisProcessor::new(supervisor, sidecar.clone())),
        }
    }

    pub fn get(&self, stage: StageKind) -> Arc<dyn StageProcessor> {
        match stage {
            StageKind::Download => self.download.clone(),
            StageKind::Processing => self.processing.clone(),
            StageKind::Analysis => self.analysis.clone(),
        }
    }
}
