//! Messages emitted by runner scripts, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Percent-complete notification from a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(percent: u8, message: Option<String>) -> Self {
        Self {
            percent: percent.min(100),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptMessage {
    Progress(ProgressUpdate),
    /// Result payload with the `type` tag removed.
    Result(Value),
    Error {
        message: String,
        details: Option<String>,
    },
    /// Anything that is not a tagged JSON object. Logged and ignored.
    Unrecognized(String),
}

impl ScriptMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Parse one framed line.
pub fn parse_line(line: &str) -> ScriptMessage {
    let trimmed = line.trim();
    let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(trimmed) else {
        return ScriptMessage::Unrecognized(line.to_string());
    };

    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return ScriptMessage::Unrecognized(line.to_string()),
    };

    match kind.as_str() {
        "progress" => ScriptMessage::Progress(parse_progress(&object)),
        "result" => ScriptMessage::Result(Value::Object(object)),
        "error" => ScriptMessage::Error {
            message: string_field(&object, "message")
                .unwrap_or_else(|| "unknown script error".to_string()),
            details: string_field(&object, "details").or_else(|| string_field(&object, "traceback")),
        },
        _ => ScriptMessage::Unrecognized(line.to_string()),
    }
}

/// A bare JSON object without a `type` key, as printed by runners that emit
/// their result untagged.
pub fn parse_untagged_object(line: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(line.trim()) {
        Ok(Value::Object(object)) if !object.contains_key("type") => Some(Value::Object(object)),
        _ => None,
    }
}

fn parse_progress(object: &Map<String, Value>) -> ProgressUpdate {
    let percent = object
        .get("percent")
        .or_else(|| object.get("progress"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 100.0)
        .round() as u8;
    ProgressUpdate::new(percent, string_field(object, "message"))
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}
