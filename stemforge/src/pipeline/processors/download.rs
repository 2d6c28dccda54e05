//! Download stage: fetch a single Spotify track to local storage.

use async_trait::async_trait;
use serde_json::Value;
use sidecar::{ChannelSupervisor, SidecarRequest};
use tracing::{debug, info};

use super::traits::{StageContext, StageOutput, StageProcessor};
use crate::config::{SidecarConfig, StorageConfig};
use crate::domain::options::{OPT_BITRATE, OPT_FORMAT, string_option};
use crate::domain::{SpotifyTrackUrl, StageJob, StageKind};
use crate::error::StageError;

pub struct DownloadProcessor {
    supervisor: ChannelSupervisor,
    sidecar: SidecarConfig,
    storage: StorageConfig,
}

impl DownloadProcessor {
    pub fn new(supervisor: ChannelSupervisor, sidecar: SidecarConfig, storage: StorageConfig) -> Self {
        Self {
            supervisor,
            sidecar,
            storage,
        }
    }

    fn request(&self, job: &StageJob, url: &SpotifyTrackUrl) -> SidecarRequest {
        let format = string_option(&job.options, OPT_FORMAT, &self.storage.audio_format);
        let bitrate = string_option(&job.options, OPT_BITRATE, &self.storage.audio_bitrate);

        SidecarRequest::new(
            self.sidecar.script_for(StageKind::Download),
            self.sidecar.timeout_for(StageKind::Download),
        )
        .arg("download")
        .arg(url.as_str())
        .arg("--output-dir")
        .arg(self.storage.downloads_dir.to_string_lossy())
        .arg("--output-template")
        .arg(job.track_id.as_str())
        .arg("--format")
        .arg(format)
        .arg("--bitrate")
        .arg(bitrate)
        .untagged_result(true)
    }
}

#[async_trait]
impl StageProcessor for DownloadProcessor {
    fn stage(&self) -> StageKind {
        StageKind::Download
    }

    fn name(&self) -> &'static str {
        "DownloadProcessor"
    }

    fn needs_source(&self) -> bool {
        false
    }

    fn validate(&self, job: &StageJob) -> Result<(), StageError> {
        SpotifyTrackUrl::from_options(&job.options).map(|_| ())
    }

    async fn process(&self, ctx: StageContext) -> Result<StageOutput, StageError> {
        let url = SpotifyTrackUrl::from_options(&ctx.job.options)?;
        tokio::fs::create_dir_all(&self.storage.downloads_dir)
            .await
            .map_err(|e| {
                StageError::Configuration(format!(
                    "cannot create {}: {e}",
                    self.storage.downloads_dir.display()
                ))
            })?;

        debug!(job_id = %ctx.job.id, url = %url, "Starting download");
        let result = self
            .supervisor
            .invoke(self.request(&ctx.job, &url), Some(ctx.progress))
            .await?;

        let path = result
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StageError::Parse {
                raw: result.to_string(),
            })?;

        let size = result.get("size").and_then(Value::as_u64).unwrap_or(0);
        info!(
            job_id = %ctx.job.id,
            spotify_id = url.track_id(),
            path = %path,
            size,
            "Download finished"
        );

        Ok(StageOutput {
            output_path: Some(path),
            result: Some(result),
            stems: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobOptions;
    use crate::domain::options::OPT_URL;
    use sidecar::ScriptLocator;

    fn processor() -> DownloadProcessor {
        DownloadProcessor::new(
            ChannelSupervisor::new(ScriptLocator::new("python3", "priv/python")),
            SidecarConfig::default(),
            StorageConfig::default(),
        )
    }

    fn job(url: &str) -> StageJob {
        let mut options = JobOptions::new();
        options.insert(OPT_URL.into(), url.into());
        StageJob::new(StageKind::Download, "track-1", options)
    }

    #[test]
    fn test_validate_requires_single_track() {
        let processor = processor();
        assert!(
            processor
                .validate(&job("https://open.spotify.com/track/4uLU6hMCjMI75M1A2tKUQC"))
                .is_ok()
        );
        assert!(matches!(
            processor.validate(&job("https://open.spotify.com/album/1DFixLWuPkv3KT3TnV35m3")),
            Err(StageError::Validation(_))
        ));
        assert!(matches!(
            processor.validate(&StageJob::new(StageKind::Download, "t", JobOptions::new())),
            Err(StageError::Validation(_))
        ));
    }

    #[test]
    fn test_request_arguments() {
        let processor = processor();
        let mut job = job("https://open.spotify.com/intl-de/track/4uLU6hMCjMI75M1A2tKUQC");
        job.options.insert(OPT_BITRATE.into(), "192k".into());
        let url = SpotifyTrackUrl::from_options(&job.options).unwrap();

        let request = processor.request(&job, &url);
        assert_eq!(request.script, "spotify_dl.py");
        assert_eq!(
            request.args,
            vec![
                "download",
                "https://open.spotify.com/intl-de/track/4uLU6hMCjMI75M1A2tKUQC",
                "--output-dir",
                "data/downloads",
                "--output-template",
                "track-1",
                "--format",
                "mp3",
                "--bitrate",
                "192k",
            ]
        );
        assert!(request.untagged_result);
    }
}
