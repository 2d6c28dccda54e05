//! Analysis stage: extract musical features from a track.

use async_trait::async_trait;
use sidecar::{ChannelSupervisor, SidecarRequest};
use tracing::info;

use super::traits::{StageContext, StageOutput, StageProcessor};
use crate::config::SidecarConfig;
use crate::domain::{AnalysisFeature, StageJob, StageKind};
use crate::error::StageError;

pub struct AnalysisProcessor {
    supervisor: ChannelSupervisor,
    sidecar: SidecarConfig,
}

impl AnalysisProcessor {
    pub fn new(supervisor: ChannelSupervisor, sidecar: SidecarConfig) -> Self {
        Self { supervisor, sidecar }
    }
}

#[async_trait]
impl StageProcessor for AnalysisProcessor {
    fn stage(&self) -> StageKind {
        StageKind::Analysis
    }

    fn name(&self) -> &'static str {
        "AnalysisProcessor"
    }

    fn validate(&self, job: &StageJob) -> Result<(), StageError> {
        AnalysisFeature::from_options(&job.options).map(|_| ())
    }

    async fn process(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let features = AnalysisFeature::from_options(&ctx.job.options)?;
        let source = ctx.require_source()?.clone();

        let request = SidecarRequest::new(
            self.sidecar.script_for(StageKind::Analysis),
            self.sidecar.timeout_for(StageKind::Analysis),
        )
        .arg(source.to_string_lossy())
        .arg("--features")
        .arg(AnalysisFeature::to_arg(&features))
        .arg("--output")
        .arg("json")
        .untagged_result(true);

        let result = self.supervisor.invoke(request, Some(ctx.progress)).await?;
        if !result.is_object() {
            return Err(StageError::Parse {
                raw: result.to_string(),
            });
        }

        info!(
            job_id = %ctx.job.id,
            features = %AnalysisFeature::to_arg(&features),
            "Analysis finished"
        );

        Ok(StageOutput {
            output_path: None,
            result: Some(result),
            stems: Vec::new(),
        })
    }
}
