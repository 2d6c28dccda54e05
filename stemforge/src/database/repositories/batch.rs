//! Batch header repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::BatchJobRow;
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::BatchJob;
use crate::{Error, Result};

#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create_batch(&self, batch: &BatchJob) -> Result<()>;
    async fn get_batch(&self, id: &str) -> Result<BatchJob>;
    async fn update_batch(&self, batch: &BatchJob) -> Result<()>;
    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>>;
}

/// SQLx implementation of BatchRepository.
pub struct SqlxBatchRepository {
    pool: SqlitePool,
}

impl SqlxBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchRepository for SqlxBatchRepository {
    async fn create_batch(&self, batch: &BatchJob) -> Result<()> {
        let row = BatchJobRow::try_from(batch)?;
        retry_on_sqlite_busy("create_batch", || async {
            sqlx::query(
                r#"
                INSERT INTO batch_jobs (
                    id, user_id, total_count, completed_count, status, options, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.user_id)
            .bind(row.total_count)
            .bind(row.completed_count)
            .bind(&row.status)
            .bind(&row.options)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, id: &str) -> Result<BatchJob> {
        sqlx::query_as::<_, BatchJobRow>("SELECT * FROM batch_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("BatchJob", id))?
            .try_into()
    }

    async fn update_batch(&self, batch: &BatchJob) -> Result<()> {
        let row = BatchJobRow::try_from(batch)?;
        let result = retry_on_sqlite_busy("update_batch", || async {
            Ok(sqlx::query(
                "UPDATE batch_jobs SET completed_count = ?, status = ?, options = ?, updated_at = ? WHERE id = ?",
            )
            .bind(row.completed_count)
            .bind(&row.status)
            .bind(&row.options)
            .bind(row.updated_at)
            .bind(&row.id)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("BatchJob", &batch.id));
        }
        Ok(())
    }

    async fn list_batches_for_user(&self, user_id: &str) -> Result<Vec<BatchJob>> {
        sqlx::query_as::<_, BatchJobRow>(
            "SELECT * FROM batch_jobs WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(BatchJob::try_from)
        .collect()
    }
}
