//! Stem repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::StemRow;
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::Stem;

#[async_trait]
pub trait StemRepository: Send + Sync {
    /// Store all stems of one processing job atomically.
    async fn create_stems(&self, stems: &[Stem]) -> Result<()>;
    async fn list_stems_for_job(&self, processing_job_id: &str) -> Result<Vec<Stem>>;
    async fn list_stems_for_track(&self, track_id: &str) -> Result<Vec<Stem>>;
}

/// SQLx implementation of StemRepository.
pub struct SqlxStemRepository {
    pool: SqlitePool,
}

impl SqlxStemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StemRepository for SqlxStemRepository {
    async fn create_stems(&self, stems: &[Stem]) -> Result<()> {
        if stems.is_empty() {
            return Ok(());
        }
        let rows: Vec<StemRow> = stems.iter().map(StemRow::from).collect();

        retry_on_sqlite_busy("create_stems", || async {
            let mut tx = self.pool.begin().await?;
            for row in &rows {
                sqlx::query(
                    r#"
                    INSERT INTO stems (
                        id, processing_job_id, track_id, stem_type, file_path, file_size, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&row.id)
                .bind(&row.processing_job_id)
                .bind(&row.track_id)
                .bind(&row.stem_type)
                .bind(&row.file_path)
                .bind(row.file_size)
                .bind(row.created_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn list_stems_for_job(&self, processing_job_id: &str) -> Result<Vec<Stem>> {
        sqlx::query_as::<_, StemRow>(
            "SELECT * FROM stems WHERE processing_job_id = ? ORDER BY stem_type",
        )
        .bind(processing_job_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Stem::try_from)
        .collect()
    }

    async fn list_stems_for_track(&self, track_id: &str) -> Result<Vec<Stem>> {
        sqlx::query_as::<_, StemRow>(
            "SELECT * FROM stems WHERE track_id = ? ORDER BY created_at, stem_type",
        )
        .bind(track_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Stem::try_from)
        .collect()
    }
}
