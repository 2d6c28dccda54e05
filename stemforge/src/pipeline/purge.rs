//! Periodic pruning of finished queue entries.
//!
//! Completed entries go after a short retention window and discarded ones
//! after a longer one. Stage job records, stems and batches are history and
//! are never touched here.

use chrono::{NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::repositories::JobRepository;
use crate::domain::QueueState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Days to keep completed entries. 0 keeps them forever.
    #[serde(default = "default_completed_retention_days")]
    pub completed_retention_days: u32,

    /// Days to keep discarded entries. 0 keeps them forever.
    #[serde(default = "default_discarded_retention_days")]
    pub discarded_retention_days: u32,

    /// Time window for purging, e.g. "02:00-05:00". Any time when unset.
    #[serde(default)]
    pub time_window: Option<String>,

    /// Rows deleted per statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_completed_retention_days() -> u32 {
    7
}

fn default_discarded_retention_days() -> u32 {
    30
}

fn default_batch_size() -> u32 {
    500
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            completed_retention_days: default_completed_retention_days(),
            discarded_retention_days: default_discarded_retention_days(),
            time_window: None,
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_days(mut self, completed: u32, discarded: u32) -> Self {
        self.completed_retention_days = completed;
        self.discarded_retention_days = discarded;
        self
    }

    pub fn with_time_window(mut self, window: Option<String>) -> Self {
        self.time_window = window;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

#[derive(Debug, Clone)]
struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    /// Parse a window such as "02:00-05:00".
    fn parse(window: &str) -> Option<Self> {
        let (start, end) = window.split_once('-')?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
        Some(Self { start, end })
    }

    fn is_within(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Overnight, e.g. 23:00-02:00
            time >= self.start || time < self.end
        }
    }
}

/// Counts from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub completed: u64,
    pub discarded: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.completed + self.discarded
    }
}

pub struct JobPurgeService {
    config: PurgeConfig,
    job_repository: Arc<dyn JobRepository>,
    time_window: Option<TimeWindow>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, job_repository: Arc<dyn JobRepository>) -> Self {
        let time_window = config.time_window.as_deref().and_then(TimeWindow::parse);

        if config.time_window.is_some() && time_window.is_none() {
            warn!(
                "Invalid time window format: {:?}. Expected format: HH:MM-HH:MM",
                config.time_window
            );
        }

        Self {
            config,
            job_repository,
            time_window,
        }
    }

    pub fn is_purge_allowed(&self) -> bool {
        match &self.time_window {
            Some(window) => window.is_within(Utc::now().time()),
            None => true,
        }
    }

    /// Run one purge pass over both retention windows.
    pub async fn run_purge(&self) -> Result<PurgeReport> {
        if !self.is_purge_allowed() {
            debug!("Purge not allowed outside time window");
            return Ok(PurgeReport::default());
        }

        let report = PurgeReport {
            completed: self
                .purge_state(QueueState::Completed, self.config.completed_retention_days)
                .await?,
            discarded: self
                .purge_state(QueueState::Discarded, self.config.discarded_retention_days)
                .await?,
        };

        if report.total() > 0 {
            info!(
                completed = report.completed,
                discarded = report.discarded,
                "Purged old queue entries"
            );
        } else {
            debug!("No queue entries to purge");
        }
        Ok(report)
    }

    async fn purge_state(&self, state: QueueState, retention_days: u32) -> Result<u64> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let batch_size = self.config.batch_size.max(1);

        let mut total: u64 = 0;
        loop {
            let deleted = self
                .job_repository
                .prune_entries(state, cutoff, batch_size)
                .await?;
            total += deleted;

            if deleted < u64::from(batch_size) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(total)
    }

    /// Spawn the periodic purge loop.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

            info!(
                completed_days = self.config.completed_retention_days,
                discarded_days = self.config.discarded_retention_days,
                interval_secs = self.config.check_interval_secs,
                "Queue purge service started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Queue purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::MemoryStore;
    use crate::domain::{JobOptions, QueueEntry, StageJob, StageKind};

    #[test]
    fn test_purge_config_default() {
        let config = PurgeConfig::default();
        assert_eq!(config.completed_retention_days, 7);
        assert_eq!(config.discarded_retention_days, 30);
        assert!(config.time_window.is_none());
    }

    #[test]
    fn test_time_window() {
        let window = TimeWindow::parse("02:00-05:00").unwrap();
        assert!(window.is_within(NaiveTime::from_hms_opt(3, 30, 0).unwrap()));
        assert!(!window.is_within(NaiveTime::from_hms_opt(5, 0, 0).unwrap()));

        let overnight = TimeWindow::parse("23:00-02:00").unwrap();
        assert!(overnight.is_within(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!overnight.is_within(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));

        assert!(TimeWindow::parse("25:00-05:00").is_none());
        assert!(TimeWindow::parse("02:00").is_none());
    }

    async fn finished_entry(store: &MemoryStore, state: QueueState, age_days: i64) {
        let job = StageJob::new(StageKind::Download, "t", JobOptions::new());
        let mut entry = QueueEntry::new(StageKind::Download, &job.id, 3);
        store.insert_job(&job, &entry).await.unwrap();
        let finished_at = Utc::now() - chrono::Duration::days(age_days);
        match state {
            QueueState::Completed => entry.mark_completed(finished_at),
            _ => entry.mark_discarded(finished_at, "boom"),
        }
        store.update_entry(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_purge_respects_retention_per_state() {
        let store = Arc::new(MemoryStore::new());
        finished_entry(&store, QueueState::Completed, 8).await;
        finished_entry(&store, QueueState::Completed, 2).await;
        finished_entry(&store, QueueState::Discarded, 8).await;
        finished_entry(&store, QueueState::Discarded, 31).await;

        let service = JobPurgeService::new(PurgeConfig::default().with_batch_size(1), store);
        let report = service.run_purge().await.unwrap();
        assert_eq!(
            report,
            PurgeReport {
                completed: 1,
                discarded: 1
            }
        );
        assert_eq!(service.run_purge().await.unwrap().total(), 0);
    }
}
