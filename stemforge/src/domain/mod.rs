//! Domain model for tracks, stage jobs, queue entries, batches and stems.

pub mod batch;
pub mod job;
pub mod options;
pub mod queue;
pub mod retry_policy;
pub mod stem;

pub use batch::{BatchCounts, BatchJob, BatchStatus};
pub use job::{JobStatus, PipelineStatus, StageJob, StageKind};
pub use options::{AnalysisFeature, DemucsModel, JobOptions, SpotifyTrackUrl};
pub use queue::{QueueEntry, QueueState};
pub use retry_policy::RetryPolicy;
pub use stem::{Stem, StemType};
