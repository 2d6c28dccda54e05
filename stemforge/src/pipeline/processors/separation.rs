//! Processing stage: split a track into stems with Demucs.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sidecar::{ChannelSupervisor, SidecarRequest};
use tracing::{info, warn};

use super::traits::{StageContext, StageOutput, StageProcessor};
use crate::config::{SidecarConfig, StorageConfig};
use crate::domain::{DemucsModel, StageJob, StageKind, Stem, StemType};
use crate::error::StageError;

pub struct SeparationProcessor {
    supervisor: ChannelSupervisor,
    sidecar: SidecarConfig,
    storage: StorageConfig,
}

impl SeparationProcessor {
    pub fn new(supervisor: ChannelSupervisor, sidecar: SidecarConfig, storage: StorageConfig) -> Self {
        Self {
            supervisor,
            sidecar,
            storage,
        }
    }

    fn output_dir(&self, job: &StageJob) -> PathBuf {
        self.storage.stems_dir.join(&job.track_id)
    }

    /// Turn the runner's `{stems: {type: path}}` map into stem records.
    async fn collect_stems(&self, job: &StageJob, result: &Value) -> Result<Vec<Stem>, StageError> {
        let Some(map) = result.get("stems").and_then(Value::as_object) else {
            return Err(StageError::Parse {
                raw: result.to_string(),
            });
        };

        let mut stems = Vec::with_capacity(map.len());
        for (name, path) in map {
            let Ok(stem_type) = StemType::from_str(name) else {
                warn!(job_id = %job.id, stem = %name, "Skipping unknown stem type");
                continue;
            };
            let Some(path) = path.as_str() else {
                warn!(job_id = %job.id, stem = %name, "Skipping stem without a path");
                continue;
            };
            let file_size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(job_id = %job.id, path = %path, error = %e, "Stem file not readable");
                    0
                }
            };
            stems.push(Stem::new(
                job.id.clone(),
                job.track_id.clone(),
                stem_type,
                path,
                file_size,
            ));
        }

        if stems.is_empty() {
            return Err(StageError::Parse {
                raw: result.to_string(),
            });
        }
        stems.sort_by_key(|stem| stem.stem_type);
        Ok(stems)
    }
}

#[async_trait]
impl StageProcessor for SeparationProcessor {
    fn stage(&self) -> StageKind {
        StageKind::Processing
    }

    fn name(&self) -> &'static str {
        "SeparationProcessor"
    }

    fn validate(&self, job: &StageJob) -> Result<(), StageError> {
        DemucsModel::from_options(&job.options).map(|_| ())
    }

    async fn process(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        // Reject bad models before anything touches the disk or spawns.
        let model = DemucsModel::from_options(&ctx.job.options)?;
        let source = ctx.require_source()?.clone();
        let output_dir = self.output_dir(&ctx.job);
        tokio::fs::create_dir_all(&output_dir).await.map_err(|e| {
            StageError::Configuration(format!("cannot create {}: {e}", output_dir.display()))
        })?;

        let request = SidecarRequest::new(
            self.sidecar.script_for(StageKind::Processing),
            self.sidecar.timeout_for(StageKind::Processing),
        )
        .arg(source.to_string_lossy())
        .arg("--model")
        .arg(model.as_ref())
        .arg("--output")
        .arg(output_dir.to_string_lossy());

        let result = self.supervisor.invoke(request, Some(ctx.progress)).await?;
        let stems = self.collect_stems(&ctx.job, &result).await?;

        if stems.len() < model.expected_stems() {
            warn!(
                job_id = %ctx.job.id,
                model = %model,
                produced = stems.len(),
                expected = model.expected_stems(),
                "Runner produced fewer stems than the model provides"
            );
        }

        let output_path = result
            .get("output_dir")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| output_dir.to_string_lossy().into_owned());

        info!(
            job_id = %ctx.job.id,
            model = %model,
            stems = stems.len(),
            "Separation finished"
        );

        Ok(StageOutput {
            output_path: Some(output_path),
            result: Some(result),
            stems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobOptions;
    use crate::domain::options::OPT_MODEL;
    use serde_json::json;
    use sidecar::ScriptLocator;
    use tokio::sync::mpsc;

    fn processor(scripts_dir: &std::path::Path, stems_dir: &std::path::Path) -> SeparationProcessor {
        SeparationProcessor::new(
            ChannelSupervisor::new(ScriptLocator::new("sh", scripts_dir)),
            SidecarConfig {
                separation_script: "separate.sh".into(),
                ..Default::default()
            },
            StorageConfig {
                stems_dir: stems_dir.to_path_buf(),
                ..Default::default()
            },
        )
    }

    fn context(model: &str, source: PathBuf) -> StageContext {
        let mut options = JobOptions::new();
        options.insert(OPT_MODEL.into(), model.into());
        let (progress, _rx) = mpsc::channel(8);
        StageContext {
            job: StageJob::new(StageKind::Processing, "track-1", options),
            source: Some(source),
            progress,
        }
    }

    #[tokio::test]
    async fn test_unsupported_model_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        std::fs::write(
            dir.path().join("separate.sh"),
            format!("touch {}\n", marker.display()),
        )
        .unwrap();
        let source = dir.path().join("song.mp3");
        std::fs::write(&source, b"audio").unwrap();

        let processor = processor(dir.path(), &dir.path().join("stems"));
        let result = processor.process(context("bogus_model", source)).await;

        match result {
            Err(StageError::Validation(msg)) => assert!(msg.contains("Unsupported model: bogus_model")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(processor.supervisor.stats().spawned, 0);
        assert!(!marker.exists());
        assert!(!dir.path().join("stems").exists());
    }

    #[tokio::test]
    async fn test_collect_stems_skips_unknown_types() {
        let dir = tempfile::tempdir().unwrap();
        let vocals = dir.path().join("vocals.wav");
        std::fs::write(&vocals, vec![0u8; 128]).unwrap();

        let processor = processor(dir.path(), dir.path());
        let job = StageJob::new(StageKind::Processing, "track-1", JobOptions::new());
        let result = json!({
            "stems": {
                "vocals": vocals.to_string_lossy(),
                "drums": dir.path().join("missing.wav").to_string_lossy(),
                "theremin": "x.wav",
            },
            "output_dir": dir.path().to_string_lossy(),
        });

        let stems = processor.collect_stems(&job, &result).await.unwrap();
        assert_eq!(stems.len(), 2);
        assert_eq!(stems[0].stem_type, StemType::Vocals);
        assert_eq!(stems[0].file_size, 128);
        assert_eq!(stems[1].stem_type, StemType::Drums);
        assert_eq!(stems[1].file_size, 0);
        assert!(stems.iter().all(|s| s.processing_job_id == job.id));
    }

    #[tokio::test]
    async fn test_result_without_stems_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(dir.path(), dir.path());
        let job = StageJob::new(StageKind::Processing, "track-1", JobOptions::new());

        let err = processor
            .collect_stems(&job, &json!({"stems": {"theremin": "x.wav"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Parse { .. }));
    }
}
