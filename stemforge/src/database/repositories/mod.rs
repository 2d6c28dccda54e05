//! Repository traits and their SQLite and in-memory implementations.

pub mod batch;
pub mod job;
pub mod memory;
pub mod stem;

use std::sync::Arc;

use crate::database::DbPool;

pub use batch::{BatchRepository, SqlxBatchRepository};
pub use job::{JobRepository, SqlxJobRepository};
pub use memory::MemoryStore;
pub use stem::{SqlxStemRepository, StemRepository};

/// The three stores the pipeline reads and writes.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub batches: Arc<dyn BatchRepository>,
    pub stems: Arc<dyn StemRepository>,
}

impl Repositories {
    /// SQLite-backed repositories sharing one pool.
    pub fn sqlite(pool: DbPool) -> Self {
        Self {
            jobs: Arc::new(SqlxJobRepository::new(pool.clone())),
            batches: Arc::new(SqlxBatchRepository::new(pool.clone())),
            stems: Arc::new(SqlxStemRepository::new(pool)),
        }
    }

    /// All three backed by one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            jobs: store.clone(),
            batches: store.clone(),
            stems: store,
        }
    }
}
