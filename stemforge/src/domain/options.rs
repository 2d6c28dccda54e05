//! Job options and their validation.
//!
//! Options are stored as a free-form JSON map on every stage job and carried
//! down the pipeline. Each stage picks out the keys it understands and
//! rejects bad values before any runner is spawned.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StageError;

/// Free-form options attached to a job.
pub type JobOptions = Map<String, Value>;

pub const OPT_URL: &str = "url";
pub const OPT_MODEL: &str = "model";
pub const OPT_FEATURES: &str = "features";
pub const OPT_FORMAT: &str = "format";
pub const OPT_BITRATE: &str = "bitrate";

/// Separation models the runner accepts.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DemucsModel {
    #[default]
    Htdemucs,
    HtdemucsFt,
    #[strum(serialize = "htdemucs_6s")]
    #[serde(rename = "htdemucs_6s")]
    Htdemucs6s,
    MdxExtra,
}

impl DemucsModel {
    pub const ALL: [DemucsModel; 4] = [
        Self::Htdemucs,
        Self::HtdemucsFt,
        Self::Htdemucs6s,
        Self::MdxExtra,
    ];

    /// Read the `model` option, falling back to the default model.
    pub fn from_options(options: &JobOptions) -> Result<Self, StageError> {
        match options.get(OPT_MODEL) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(name)) => name.parse().map_err(|_| {
                StageError::validation(format!(
                    "Unsupported model: {name}. Expected one of: {}",
                    join(Self::ALL.iter())
                ))
            }),
            Some(other) => Err(StageError::validation(format!(
                "model must be a string, got {other}"
            ))),
        }
    }

    /// Number of stems the model produces.
    pub fn expected_stems(&self) -> usize {
        match self {
            Self::Htdemucs6s => 6,
            _ => 4,
        }
    }
}

/// Features the analysis runner can extract.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AnalysisFeature {
    Tempo,
    Key,
    Energy,
    Spectral,
    Mfcc,
    Chroma,
    All,
}

impl AnalysisFeature {
    pub const DEFAULT: [AnalysisFeature; 3] = [Self::Tempo, Self::Key, Self::Energy];

    /// Read the `features` option as an array or a comma-separated string.
    ///
    /// Duplicates are dropped, order is kept, and an empty selection falls
    /// back to the default set.
    pub fn from_options(options: &JobOptions) -> Result<Vec<Self>, StageError> {
        let names: Vec<String> = match options.get(OPT_FEATURES) {
            None | Some(Value::Null) => return Ok(Self::DEFAULT.to_vec()),
            Some(Value::String(s)) => s.split(',').map(|f| f.trim().to_string()).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                        StageError::validation(format!("feature names must be strings, got {item}"))
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(StageError::validation(format!(
                    "features must be a list or comma-separated string, got {other}"
                )));
            }
        };

        let mut features = Vec::new();
        let mut invalid = Vec::new();
        for name in names.iter().filter(|n| !n.is_empty()) {
            match AnalysisFeature::from_str(name) {
                Ok(feature) if !features.contains(&feature) => features.push(feature),
                Ok(_) => {}
                Err(_) => invalid.push(name.as_str()),
            }
        }

        if !invalid.is_empty() {
            return Err(StageError::validation(format!(
                "Invalid features: {}",
                invalid.join(", ")
            )));
        }
        if features.is_empty() {
            return Ok(Self::DEFAULT.to_vec());
        }
        Ok(features)
    }

    /// Comma-separated form passed to the runner.
    pub fn to_arg(features: &[Self]) -> String {
        join(features.iter())
    }
}

static SPOTIFY_URL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"spotify\.com/(?:intl-[a-z]+/)?(track|album|playlist)/([A-Za-z0-9]+)").ok()
});

/// A Spotify single-track URL accepted by the download stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotifyTrackUrl {
    url: String,
    track_id: String,
}

impl SpotifyTrackUrl {
    pub fn parse(url: &str) -> Result<Self, StageError> {
        let re = SPOTIFY_URL_RE
            .as_ref()
            .ok_or_else(|| StageError::Configuration("invalid Spotify URL pattern".into()))?;
        let captures = re
            .captures(url)
            .ok_or_else(|| StageError::validation(format!("Invalid Spotify URL: {url}")))?;

        if &captures[1] != "track" {
            return Err(StageError::validation(
                "Download only supports single tracks",
            ));
        }

        Ok(Self {
            url: url.trim().to_string(),
            track_id: captures[2].to_string(),
        })
    }

    pub fn from_options(options: &JobOptions) -> Result<Self, StageError> {
        match options.get(OPT_URL).and_then(Value::as_str) {
            Some(url) => Self::parse(url),
            None => Err(StageError::validation("download job is missing the url option")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }
}

impl fmt::Display for SpotifyTrackUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Read a string option, with a default.
pub fn string_option<'a>(options: &'a JobOptions, key: &str, default: &'a str) -> &'a str {
    options.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn join<T: fmt::Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}
