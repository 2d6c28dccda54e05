//! Separated stems produced by successful processing jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum StemType {
    Vocals,
    Drums,
    Bass,
    Other,
    Guitar,
    Piano,
}

impl StemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vocals => "vocals",
            Self::Drums => "drums",
            Self::Bass => "bass",
            Self::Other => "other",
            Self::Guitar => "guitar",
            Self::Piano => "piano",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stem {
    pub id: String,
    pub processing_job_id: String,
    pub track_id: String,
    pub stem_type: StemType,
    pub file_path: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

impl Stem {
    pub fn new(
        processing_job_id: impl Into<String>,
        track_id: impl Into<String>,
        stem_type: StemType,
        file_path: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            processing_job_id: processing_job_id.into(),
            track_id: track_id.into(),
            stem_type,
            file_path: file_path.into(),
            file_size,
            created_at: Utc::now(),
        }
    }
}
