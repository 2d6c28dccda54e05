//! Application configuration.
//!
//! Every value has a default and can be overridden from the environment
//! (after `.env` has been loaded by the binary).
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | `sqlite:stemforge.db?mode=rwc` |
//! | `LOG_DIR` | `logs` |
//! | `PYTHON_PATH` | `python3` |
//! | `SCRIPTS_DIR` | `priv/python` |
//! | `DOWNLOAD_SCRIPT` / `SEPARATION_SCRIPT` / `ANALYSIS_SCRIPT` | `spotify_dl.py` / `demucs_runner.py` / `analyzer.py` |
//! | `DOWNLOAD_TIMEOUT_SECS` / `SEPARATION_TIMEOUT_SECS` / `ANALYSIS_TIMEOUT_SECS` | 300 / 300 / 120 |
//! | `DOWNLOADS_DIR` / `STEMS_DIR` | `data/downloads` / `data/stems` |
//! | `AUDIO_FORMAT` / `AUDIO_BITRATE` | `mp3` / `320k` |
//! | `DOWNLOAD_CONCURRENCY` / `PROCESSING_CONCURRENCY` / `ANALYSIS_CONCURRENCY` | 3 / 2 / 2 |
//! | `QUEUE_POLL_INTERVAL_MS` | 1000 |
//! | `QUEUE_MAX_ATTEMPTS` | 3 |
//! | `RETRY_BASE_DELAY_SECS` / `RETRY_MAX_DELAY_SECS` | 15 / 600 |
//! | `RESCUE_AFTER_SECS` / `RESCUE_INTERVAL_SECS` | 1800 / 60 |
//! | `PRUNE_COMPLETED_DAYS` / `PRUNE_DISCARDED_DAYS` | 7 / 30 |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{RetryPolicy, StageKind};
use crate::pipeline::purge::PurgeConfig;
use crate::pipeline::rescue::RescueConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarConfig {
    /// Interpreter that runs the scripts; a bare name is looked up on PATH.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default = "default_download_script")]
    pub download_script: String,
    #[serde(default = "default_separation_script")]
    pub separation_script: String,
    #[serde(default = "default_analysis_script")]
    pub analysis_script: String,
    #[serde(default = "default_long_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_long_timeout_secs")]
    pub separation_timeout_secs: u64,
    #[serde(default = "default_short_timeout_secs")]
    pub analysis_timeout_secs: u64,
}

fn default_runtime() -> String {
    "python3".to_string()
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("priv/python")
}

fn default_download_script() -> String {
    "spotify_dl.py".to_string()
}

fn default_separation_script() -> String {
    "demucs_runner.py".to_string()
}

fn default_analysis_script() -> String {
    "analyzer.py".to_string()
}

fn default_long_timeout_secs() -> u64 {
    300
}

fn default_short_timeout_secs() -> u64 {
    120
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            scripts_dir: default_scripts_dir(),
            download_script: default_download_script(),
            separation_script: default_separation_script(),
            analysis_script: default_analysis_script(),
            download_timeout_secs: default_long_timeout_secs(),
            separation_timeout_secs: default_long_timeout_secs(),
            analysis_timeout_secs: default_short_timeout_secs(),
        }
    }
}

impl SidecarConfig {
    pub fn timeout_for(&self, stage: StageKind) -> Duration {
        Duration::from_secs(match stage {
            StageKind::Download => self.download_timeout_secs,
            StageKind::Processing => self.separation_timeout_secs,
            StageKind::Analysis => self.analysis_timeout_secs,
        })
    }

    pub fn script_for(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::Download => &self.download_script,
            StageKind::Processing => &self.separation_script,
            StageKind::Analysis => &self.analysis_script,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_stems_dir")]
    pub stems_dir: PathBuf,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}

fn default_stems_dir() -> PathBuf {
    PathBuf::from("data/stems")
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_audio_bitrate() -> String {
    "320k".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            stems_dir: default_stems_dir(),
            audio_format: default_audio_format(),
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

/// Pool widths per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    #[serde(default = "default_processing_concurrency")]
    pub processing_concurrency: usize,
    #[serde(default = "default_analysis_concurrency")]
    pub analysis_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_download_concurrency() -> usize {
    3
}

fn default_processing_concurrency() -> usize {
    2
}

fn default_analysis_concurrency() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            download_concurrency: default_download_concurrency(),
            processing_concurrency: default_processing_concurrency(),
            analysis_concurrency: default_analysis_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WorkersConfig {
    pub fn concurrency_for(&self, stage: StageKind) -> usize {
        match stage {
            StageKind::Download => self.download_concurrency,
            StageKind::Processing => self.processing_concurrency,
            StageKind::Analysis => self.analysis_concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub sidecar: SidecarConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rescue: RescueConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
}

fn default_database_url() -> String {
    "sqlite:stemforge.db?mode=rwc".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            sidecar: SidecarConfig::default(),
            storage: StorageConfig::default(),
            workers: WorkersConfig::default(),
            retry: RetryPolicy::default(),
            rescue: RescueConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = text("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = text("LOG_DIR") {
            config.log_dir = dir.into();
        }

        let sidecar = &mut config.sidecar;
        if let Some(runtime) = text("PYTHON_PATH") {
            sidecar.runtime = runtime;
        }
        if let Some(dir) = text("SCRIPTS_DIR") {
            sidecar.scripts_dir = dir.into();
        }
        if let Some(script) = text("DOWNLOAD_SCRIPT") {
            sidecar.download_script = script;
        }
        if let Some(script) = text("SEPARATION_SCRIPT") {
            sidecar.separation_script = script;
        }
        if let Some(script) = text("ANALYSIS_SCRIPT") {
            sidecar.analysis_script = script;
        }
        set_parsed(&lookup, "DOWNLOAD_TIMEOUT_SECS", &mut sidecar.download_timeout_secs);
        set_parsed(&lookup, "SEPARATION_TIMEOUT_SECS", &mut sidecar.separation_timeout_secs);
        set_parsed(&lookup, "ANALYSIS_TIMEOUT_SECS", &mut sidecar.analysis_timeout_secs);

        let storage = &mut config.storage;
        if let Some(dir) = text("DOWNLOADS_DIR") {
            storage.downloads_dir = dir.into();
        }
        if let Some(dir) = text("STEMS_DIR") {
            storage.stems_dir = dir.into();
        }
        if let Some(format) = text("AUDIO_FORMAT") {
            storage.audio_format = format;
        }
        if let Some(bitrate) = text("AUDIO_BITRATE") {
            storage.audio_bitrate = bitrate;
        }

        let workers = &mut config.workers;
        set_parsed(&lookup, "DOWNLOAD_CONCURRENCY", &mut workers.download_concurrency);
        set_parsed(&lookup, "PROCESSING_CONCURRENCY", &mut workers.processing_concurrency);
        set_parsed(&lookup, "ANALYSIS_CONCURRENCY", &mut workers.analysis_concurrency);
        set_parsed(&lookup, "QUEUE_POLL_INTERVAL_MS", &mut workers.poll_interval_ms);

        set_parsed(&lookup, "QUEUE_MAX_ATTEMPTS", &mut config.retry.max_attempts);
        let mut base_secs = config.retry.initial_delay_ms / 1000;
        if set_parsed(&lookup, "RETRY_BASE_DELAY_SECS", &mut base_secs) {
            config.retry.initial_delay_ms = base_secs.saturating_mul(1000);
        }
        let mut max_secs = config.retry.max_delay_ms / 1000;
        if set_parsed(&lookup, "RETRY_MAX_DELAY_SECS", &mut max_secs) {
            config.retry.max_delay_ms = max_secs.saturating_mul(1000);
        }

        set_parsed(&lookup, "RESCUE_AFTER_SECS", &mut config.rescue.rescue_after_secs);
        set_parsed(&lookup, "RESCUE_INTERVAL_SECS", &mut config.rescue.check_interval_secs);
        set_parsed(&lookup, "PRUNE_COMPLETED_DAYS", &mut config.purge.completed_retention_days);
        set_parsed(&lookup, "PRUNE_DISCARDED_DAYS", &mut config.purge.discarded_retention_days);

        config
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        for stage in StageKind::ALL {
            if self.workers.concurrency_for(stage) == 0 {
                return Err(crate::Error::config(format!(
                    "{stage} concurrency must be at least 1"
                )));
            }
            if self.sidecar.timeout_for(stage).is_zero() {
                return Err(crate::Error::config(format!(
                    "{stage} timeout must be greater than zero"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::config("QUEUE_MAX_ATTEMPTS must be at least 1"));
        }
        Ok(())
    }
}

fn set_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> bool {
    match lookup(key).map(|v| v.trim().parse::<T>()) {
        Some(Ok(value)) => {
            *target = value;
            true
        }
        Some(Err(_)) => {
            tracing::warn!("Ignoring invalid value for {}", key);
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.workers.concurrency_for(StageKind::Download), 3);
        assert_eq!(config.workers.concurrency_for(StageKind::Processing), 2);
        assert_eq!(config.workers.concurrency_for(StageKind::Analysis), 2);
        assert_eq!(
            config.sidecar.timeout_for(StageKind::Analysis),
            Duration::from_secs(120)
        );
        assert_eq!(
            config.sidecar.timeout_for(StageKind::Processing),
            Duration::from_secs(300)
        );
        assert_eq!(config.rescue.rescue_after_secs, 1800);
        assert_eq!(config.purge.completed_retention_days, 7);
        assert_eq!(config.purge.discarded_retention_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("PYTHON_PATH", "/opt/venv/bin/python"),
            ("ANALYSIS_TIMEOUT_SECS", "45"),
            ("PROCESSING_CONCURRENCY", "1"),
            ("RETRY_BASE_DELAY_SECS", "5"),
            ("PRUNE_COMPLETED_DAYS", "1"),
        ]);
        assert_eq!(config.sidecar.runtime, "/opt/venv/bin/python");
        assert_eq!(config.sidecar.analysis_timeout_secs, 45);
        assert_eq!(config.workers.processing_concurrency, 1);
        assert_eq!(config.retry.initial_delay_ms, 5000);
        assert_eq!(config.purge.completed_retention_days, 1);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[("DOWNLOAD_CONCURRENCY", "lots"), ("DATABASE_URL", "  ")]);
        assert_eq!(config.workers.download_concurrency, 3);
        assert_eq!(config.database_url, default_database_url());
    }

    #[test]
    fn test_validate_rejects_zero_width_pool() {
        let config = config_from(&[("ANALYSIS_CONCURRENCY", "0")]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: AppConfig =
            serde_json::from_str(r#"{"workers": {"download_concurrency": 5}}"#).unwrap();
        assert_eq!(config.workers.download_concurrency, 5);
        assert_eq!(config.workers.analysis_concurrency, 2);
        assert_eq!(config.sidecar.download_script, "spotify_dl.py");
    }
}
