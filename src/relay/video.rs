//! Rerank, speech and video request payloads.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Inbound `/v1/rerank` body.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RerankRequest {
    pub model: String,
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default)]
    pub top_n: Option<u32>,
    #[serde(default)]
    pub return_documents: bool,
}

/// Inbound `/v1/audio/speech` body.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl SpeechRequest {
    pub fn content_type(&self) -> &'static str {
        match self.response_format.as_deref().unwrap_or("mp3") {
            "opus" => "audio/ogg",
            "aac" => "audio/aac",
            "flac" => "audio/flac",
            "wav" => "audio/wav",
            "pcm" => "audio/pcm",
            _ => "audio/mpeg",
        }
    }
}

/// Inbound `/v1/videos` body.
///
/// Clients disagree on how to spell duration and resolution, so several
/// aliases are accepted and resolved by precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VideoRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub seconds: Option<f64>,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    /// Optional first-frame image.
    #[serde(default, alias = "input_reference")]
    pub image_url: Option<String>,
}

impl VideoRequest {
    /// `duration_seconds` > `seconds` > `duration`; the first positive value wins.
    pub fn resolve_duration(&self) -> Option<f64> {
        [self.duration_seconds, self.seconds, self.duration]
            .into_iter()
            .flatten()
            .find(|d| d.is_finite() && *d > 0.0)
    }

    /// `size` > `resolution`; the first non-empty value wins, else `""`.
    pub fn resolve_resolution(&self) -> String {
        [self.size.as_deref(), self.resolution.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or("")
            .to_string()
    }
}

/// Accept `8`, `8.5` or `"8.5"`. Anything unparseable is treated as absent.
fn flexible_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

/// State of an upstream video job.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoJob {
    pub task_id: String,
    pub model: String,
    pub status: VideoStatus,
    pub progress: Option<u32>,
    pub seconds: Option<f64>,
    pub size: Option<String>,
    pub video_url: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

impl VideoJob {
    pub fn queued(task_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            model: model.into(),
            status: VideoStatus::Queued,
            progress: None,
            seconds: None,
            size: None,
            video_url: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// OpenAI video object shape.
    pub fn to_openai_json(&self) -> Value {
        let mut v = json!({
            "id": self.task_id,
            "object": "video",
            "model": self.model,
            "status": self.status,
            "created_at": self.created_at,
        });
        if let Some(p) = self.progress {
            v["progress"] = json!(p);
        }
        if let Some(s) = self.seconds {
            // OpenAI reports seconds as a string
            v["seconds"] = json!(format_seconds(s));
        }
        if let Some(size) = &self.size {
            v["size"] = json!(size);
        }
        if let Some(url) = &self.video_url {
            v["video_url"] = json!(url);
        }
        if let Some(err) = &self.error {
            v["error"] = json!({ "message": err });
        }
        v
    }
}

pub(crate) fn format_seconds(s: f64) -> String {
    if s.fract() == 0.0 {
        format!("{}", s as i64)
    } else {
        format!("{}", s)
    }
}
