//! In-memory store for tests and ephemeral runs.
//!
//! Implements every repository trait over process memory. Queue entries sit
//! behind one mutex so claims stay atomic across workers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::batch::BatchRepository;
use super::job::{JobRepository, ORPHANED_ERROR};
use super::stem::StemRepository;
use crate::domain::{
    BatchCounts, BatchJob, JobStatus, QueueEntry, QueueState, StageJob, StageKind, Stem,
};
use crate::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<String, StageJob>,
    entries: Mutex<HashMap<String, QueueEntry>>,
    batches: DashMap<String, BatchJob>,
    stems: DashMap<String, Vec<Stem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_job(&self, job: &StageJob, entry: &QueueEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        if self.jobs.contains_key(&job.id) {
            return Err(Error::Database(format!("duplicate job id {}", job.id)));
        }
        self.jobs.insert(job.id.clone(), job.clone());
        entries.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<StageJob> {
        self.jobs
            .get(id)
            .map(|job| job.clone())
            .ok_or_else(|| Error::not_found("StageJob", id))
    }

    async fn update_job(&self, job: &StageJob) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(mut stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(Error::not_found("StageJob", &job.id)),
        }
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool> {
        match self.jobs.get_mut(id) {
            Some(mut job) if job.status == JobStatus::Active => {
                job.progress = progress.min(100);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs_for_track(&self, track_id: &str) -> Result<Vec<StageJob>> {
        let mut jobs: Vec<StageJob> = self
            .jobs
            .iter()
            .filter(|job| job.track_id == track_id)
            .map(|job| job.clone())
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.stage));
        Ok(jobs)
    }

    async fn count_batch_jobs(&self, batch_id: &str) -> Result<BatchCounts> {
        let mut counts = BatchCounts::default();
        for job in self.jobs.iter() {
            if job.stage != StageKind::Processing || job.batch_id.as_deref() != Some(batch_id) {
                continue;
            }
            match job.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self, stage: StageKind, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let mut entries = self.entries.lock();
        let next = entries
            .values_mut()
            .filter(|entry| entry.stage == stage && entry.is_due(now))
            .min_by_key(|entry| (entry.scheduled_at, entry.inserted_at));

        Ok(next.map(|entry| {
            entry.mark_executing(now);
            entry.clone()
        }))
    }

    async fn get_entry(&self, id: &str) -> Result<QueueEntry> {
        self.entries
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("QueueEntry", id))
    }

    async fn get_entry_for_job(&self, job_id: &str) -> Result<QueueEntry> {
        self.entries
            .lock()
            .values()
            .find(|entry| entry.job_id == job_id)
            .cloned()
            .ok_or_else(|| Error::not_found("QueueEntry", job_id))
    }

    async fn update_entry(&self, entry: &QueueEntry) -> Result<()> {
        match self.entries.lock().get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(Error::not_found("QueueEntry", &entry.id)),
        }
    }

    async fn rescue_orphaned(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let mut entries = self.entries.lock();
        let mut rescued = Vec::new();
        for entry in entries.values_mut() {
            let orphaned = entry.state == QueueState::Executing
                && entry.attempted_at.is_some_and(|at| at < cutoff);
            if !orphaned {
                continue;
            }
            if entry.attempts_exhausted() {
                entry.mark_discarded(now, ORPHANED_ERROR);
            } else {
                entry.mark_rescued(now);
                entry.last_error = Some(ORPHANED_ERROR.to_string());
            }
            entry.scheduled_at = now;
            rescued.push(entry.clone());
        }
        Ok(rescued)
    }

    async fn prune_entries(
        &self,
        state: QueueState,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64> {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .values()
            .filter(|entry| {
                entry.state == state && entry.completed_at.is_some_and(|at| at < older_than)
            })
            .take(limit as usize)
            .map(|entry| entry.id.clone())
            .collect();
        for id in &doomed {
            entries.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count_ready(&self, stage: StageKind, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|entry| entry.stage == stage && entry.is_due(now))
            .count() as u64)
    }
}

#[async_trait]
impl BatchRepository for MemoryStore {
    async fn create_batch(&self, batch: &BatchJob) -> Result<()> {
        self.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<BatchJob> {
        self.batches
            .get(id)
            .map(|batch| batch.clone())
            .ok_or_else(|| Error::not_found("BatchJob", id))
    }

    async fn update_batch(&self, batch: &BatchJob) -> Result<()> {
        match self.batches.get_mut(&batch.id) {
            Some(mut stored) => {
                *stored = batch.clone();
                Ok(())
            }
            None => Err(Error::not_found("BatchJob", &batch.id)),
        }
    }

    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>> {
        let mut batches: Vec<BatchJob> = self
            .batches
            .iter()
            .filter(|batch| batch.user_id == user_id)
            .map(|batch| batch.clone())
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }
}

#[async_trait]
impl StemRepository for MemoryStore {
    async fn create_stems(&self, stems: &[Stem]) -> Result<()> {
        for stem in stems {
            self.stems
                .entry(stem.processing_job_id.clone())
                .or_default()
                .push(stem.clone());
        }
        Ok(())
    }

    async fn list_stems_for_job(&self, processing_job_id: &str) -> Result<Vec<Stem>> {
        let mut stems = self
            .stems
            .get(processing_job_id)
            .map(|stems| stems.clone())
            .unwrap_or_default();
        stems.sort_by_key(|stem| stem.stem_type.as_str());
        Ok(stems)
    }

    async fn list_stems_for_track(&self, track_id: &str) -> Result<Vec<Stem>> {
        let mut stems: Vec<Stem> = self
            .stems
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|stem| stem.track_id == track_id)
            .collect();
        stems.sort_by_key(|stem| (stem.created_at, stem.stem_type.as_str()));
        Ok(stems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobOptions;
    use chrono::Duration;

    async fn new_job(store: &MemoryStore, stage: StageKind) -> (StageJob, QueueEntry) {
        let job = StageJob::new(stage, "track", JobOptions::new());
        let entry = QueueEntry::new(stage, &job.id, 2);
        store.insert_job(&job, &entry).await.unwrap();
        (job, entry)
    }

    #[tokio::test]
    async fn test_claim_is_per_stage_and_exclusive() {
        let store = MemoryStore::new();
        let (_, download) = new_job(&store, StageKind::Download).await;
        new_job(&store, StageKind::Processing).await;

        let now = Utc::now();
        let claimed = store.claim_next(StageKind::Download, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, download.id);
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.state, QueueState::Executing);

        assert!(store.claim_next(StageKind::Download, now).await.unwrap().is_none());
        assert_eq!(store.count_ready(StageKind::Processing, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retryable_entry_waits_for_schedule() {
        let store = MemoryStore::new();
        new_job(&store, StageKind::Analysis).await;
        let now = Utc::now();

        let mut entry = store.claim_next(StageKind::Analysis, now).await.unwrap().unwrap();
        entry.mark_retryable(now + Duration::seconds(60), "timeout");
        store.update_entry(&entry).await.unwrap();

        assert!(store.claim_next(StageKind::Analysis, now).await.unwrap().is_none());
        let later = now + Duration::seconds(61);
        let again = store.claim_next(StageKind::Analysis, later).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_rescue_and_prune() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = now - Duration::minutes(45);
        let cutoff = now - Duration::minutes(30);

        // Enqueued and first claimed 45 minutes ago.
        let job = StageJob::new(StageKind::Processing, "track", JobOptions::new());
        let mut entry = QueueEntry::new(StageKind::Processing, &job.id, 2);
        entry.scheduled_at = stale;
        store.insert_job(&job, &entry).await.unwrap();

        store.claim_next(StageKind::Processing, stale).await.unwrap().unwrap();
        let rescued = store.rescue_orphaned(cutoff, now).await.unwrap();
        assert_eq!(rescued.len(), 1);
        assert_eq!(rescued[0].state, QueueState::Available);
        assert_eq!(rescued[0].attempt, 1);

        // Second delivery also goes stale and exhausts the two attempts.
        let entry = store.claim_next(StageKind::Processing, now).await.unwrap().unwrap();
        assert_eq!(entry.attempt, 2);
        let rescued = store
            .rescue_orphaned(now + Duration::seconds(1), now)
            .await
            .unwrap();
        assert_eq!(rescued[0].state, QueueState::Discarded);

        let pruned = store
            .prune_entries(QueueState::Discarded, now + Duration::seconds(1), 100)
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_progress_only_while_active() {
        let store = MemoryStore::new();
        let (mut job, _) = new_job(&store, StageKind::Download).await;
        assert!(!store.update_progress(&job.id, 40).await.unwrap());

        job.mark_active().unwrap();
        store.update_job(&job).await.unwrap();
        assert!(store.update_progress(&job.id, 40).await.unwrap());
        assert_eq!(store.get_job(&job.id).await.unwrap().progress, 40);
    }
}
