//! Stage pipeline: Download → Processing → Analysis.
//!
//! Each stage has its own durable queue and bounded worker pool. Stages are
//! chained explicitly: a worker enqueues the next stage only after its own
//! job completed.

pub mod job_queue;
pub mod manager;
pub mod processors;
pub mod progress;
pub mod purge;
pub mod rescue;
pub mod worker;
pub mod worker_pool;

pub use job_queue::{ClaimedJob, JobQueue, RetryDecision};
pub use manager::{PipelineManager, StageStats};
pub use processors::{StageContext, StageOutput, StageProcessor, StageProcessors};
pub use purge::{JobPurgeService, PurgeConfig, PurgeReport};
pub use rescue::{RescueConfig, RescueReport, RescueService};
pub use worker::{StageWorker, TickOutcome, TickReport};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
