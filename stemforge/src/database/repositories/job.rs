//! Stage job and queue entry repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{QueueEntryRow, StageJobRow};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::domain::{BatchCounts, JobStatus, QueueEntry, QueueState, StageJob, StageKind};
use crate::{Error, Result};

/// Error recorded on entries returned to the queue by the rescue sweep.
pub const ORPHANED_ERROR: &str = "orphaned: worker stopped without reporting an outcome";

/// Storage for stage jobs and the queue entries that deliver them.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Store a new job together with its queue entry.
    async fn insert_job(&self, job: &StageJob, entry: &QueueEntry) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<StageJob>;
    async fn update_job(&self, job: &StageJob) -> Result<()>;
    /// Record progress. Ignored unless the job is active; returns whether a
    /// row was updated.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool>;
    /// Jobs of every stage for a track, oldest first.
    async fn list_jobs_for_track(&self, track_id: &str) -> Result<Vec<StageJob>>;
    /// Processing jobs linked to a batch, counted by status.
    async fn count_batch_jobs(&self, batch_id: &str) -> Result<BatchCounts>;

    /// Atomically claim the next due entry of `stage`, moving it to
    /// `executing` and counting the attempt.
    async fn claim_next(&self, stage: StageKind, now: DateTime<Utc>) -> Result<Option<QueueEntry>>;
    async fn get_entry(&self, id: &str) -> Result<QueueEntry>;
    async fn get_entry_for_job(&self, job_id: &str) -> Result<QueueEntry>;
    async fn update_entry(&self, entry: &QueueEntry) -> Result<()>;
    /// Return entries executing since before `cutoff` to the queue, or
    /// discard them when out of attempts. Returns the updated entries.
    async fn rescue_orphaned(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>>;
    /// Delete up to `limit` entries in `state` finished before `older_than`.
    async fn prune_entries(
        &self,
        state: QueueState,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64>;
    /// Entries of `stage` that could be claimed now.
    async fn count_ready(&self, stage: StageKind, now: DateTime<Utc>) -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn insert_job(&self, job: &StageJob, entry: &QueueEntry) -> Result<()> {
        let job_row = StageJobRow::try_from(job)?;
        let entry_row = QueueEntryRow::from(entry);

        retry_on_sqlite_busy("insert_job", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO stage_jobs (
                    id, stage, track_id, status, progress, output_path, error, options,
                    batch_id, result, created_at, updated_at, started_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job_row.id)
            .bind(&job_row.stage)
            .bind(&job_row.track_id)
            .bind(&job_row.status)
            .bind(job_row.progress)
            .bind(&job_row.output_path)
            .bind(&job_row.error)
            .bind(&job_row.options)
            .bind(&job_row.batch_id)
            .bind(&job_row.result)
            .bind(job_row.created_at)
            .bind(job_row.updated_at)
            .bind(job_row.started_at)
            .bind(job_row.completed_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO queue_entries (
                    id, stage, job_id, state, attempt, max_attempts, scheduled_at,
                    attempted_at, completed_at, last_error, inserted_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry_row.id)
            .bind(&entry_row.stage)
            .bind(&entry_row.job_id)
            .bind(&entry_row.state)
            .bind(entry_row.attempt)
            .bind(entry_row.max_attempts)
            .bind(entry_row.scheduled_at)
            .bind(entry_row.attempted_at)
            .bind(entry_row.completed_at)
            .bind(&entry_row.last_error)
            .bind(entry_row.inserted_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<StageJob> {
        sqlx::query_as::<_, StageJobRow>("SELECT * FROM stage_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("StageJob", id))?
            .try_into()
    }

    async fn update_job(&self, job: &StageJob) -> Result<()> {
        let row = StageJobRow::try_from(job)?;
        let result = retry_on_sqlite_busy("update_job", || async {
            Ok(sqlx::query(
                r#"
                UPDATE stage_jobs SET
                    status = ?, progress = ?, output_path = ?, error = ?, options = ?,
                    batch_id = ?, result = ?, updated_at = ?, started_at = ?, completed_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&row.status)
            .bind(row.progress)
            .bind(&row.output_path)
            .bind(&row.error)
            .bind(&row.options)
            .bind(&row.batch_id)
            .bind(&row.result)
            .bind(row.updated_at)
            .bind(row.started_at)
            .bind(row.completed_at)
            .bind(&row.id)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("StageJob", &job.id));
        }
        Ok(())
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE stage_jobs SET progress = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(i64::from(progress.min(100)))
        .bind(now_ms())
        .bind(id)
        .bind(JobStatus::Active.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_jobs_for_track(&self, track_id: &str) -> Result<Vec<StageJob>> {
        sqlx::query_as::<_, StageJobRow>(
            "SELECT * FROM stage_jobs WHERE track_id = ? ORDER BY created_at, rowid",
        )
        .bind(track_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(StageJob::try_from)
        .collect()
    }

    async fn count_batch_jobs(&self, batch_id: &str) -> Result<BatchCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM stage_jobs
            WHERE batch_id = ? AND stage = ?
            GROUP BY status
            "#,
        )
        .bind(batch_id)
        .bind(StageKind::Processing.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BatchCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u32;
            match JobStatus::parse(&status) {
                Some(JobStatus::Queued) => counts.queued += count,
                Some(JobStatus::Active) => counts.active += count,
                Some(JobStatus::Completed) => counts.completed += count,
                Some(JobStatus::Failed) => counts.failed += count,
                None => tracing::warn!("Ignoring unknown job status '{}' in batch count", status),
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self, stage: StageKind, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let now = datetime_to_ms(now);
        let row = retry_on_sqlite_busy("claim_next", || async {
            Ok(sqlx::query_as::<_, QueueEntryRow>(
                r#"
                UPDATE queue_entries
                SET state = 'executing', attempt = attempt + 1, attempted_at = ?
                WHERE id = (
                    SELECT id FROM queue_entries
                    WHERE stage = ? AND state IN ('available', 'retryable') AND scheduled_at <= ?
                    ORDER BY scheduled_at, inserted_at
                    LIMIT 1
                )
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(stage.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        row.map(QueueEntry::try_from).transpose()
    }

    async fn get_entry(&self, id: &str) -> Result<QueueEntry> {
        sqlx::query_as::<_, QueueEntryRow>("SELECT * FROM queue_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("QueueEntry", id))?
            .try_into()
    }

    async fn get_entry_for_job(&self, job_id: &str) -> Result<QueueEntry> {
        sqlx::query_as::<_, QueueEntryRow>("SELECT * FROM queue_entries WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("QueueEntry", job_id))?
            .try_into()
    }

    async fn update_entry(&self, entry: &QueueEntry) -> Result<()> {
        let row = QueueEntryRow::from(entry);
        let result = retry_on_sqlite_busy("update_entry", || async {
            Ok(sqlx::query(
                r#"
                UPDATE queue_entries SET
                    state = ?, attempt = ?, max_attempts = ?, scheduled_at = ?,
                    attempted_at = ?, completed_at = ?, last_error = ?
                WHERE id = ?
                "#,
            )
            .bind(&row.state)
            .bind(row.attempt)
            .bind(row.max_attempts)
            .bind(row.scheduled_at)
            .bind(row.attempted_at)
            .bind(row.completed_at)
            .bind(&row.last_error)
            .bind(&row.id)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("QueueEntry", &entry.id));
        }
        Ok(())
    }

    async fn rescue_orphaned(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        let now = datetime_to_ms(now);
        let rows = retry_on_sqlite_busy("rescue_orphaned", || async {
            Ok(sqlx::query_as::<_, QueueEntryRow>(
                r#"
                UPDATE queue_entries SET
                    state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END,
                    completed_at = CASE WHEN attempt >= max_attempts THEN ? ELSE completed_at END,
                    scheduled_at = ?,
                    last_error = ?
                WHERE state = 'executing' AND attempted_at < ?
                RETURNING *
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(ORPHANED_ERROR)
            .bind(datetime_to_ms(cutoff))
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        rows.into_iter().map(QueueEntry::try_from).collect()
    }

    async fn prune_entries(
        &self,
        state: QueueState,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64> {
        let result = retry_on_sqlite_busy("prune_entries", || async {
            Ok(sqlx::query(
                r#"
                DELETE FROM queue_entries WHERE id IN (
                    SELECT id FROM queue_entries
                    WHERE state = ? AND completed_at IS NOT NULL AND completed_at < ?
                    LIMIT ?
                )
                "#,
            )
            .bind(state.as_str())
            .bind(datetime_to_ms(older_than))
            .bind(i64::from(limit))
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_ready(&self, stage: StageKind, now: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_entries
            WHERE stage = ? AND state IN ('available', 'retryable') AND scheduled_at <= ?
            "#,
        )
        .bind(stage.as_str())
        .bind(datetime_to_ms(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
