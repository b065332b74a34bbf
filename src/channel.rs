//! Channel configuration and storage.
//!
//! A channel is one configured credential/endpoint for one upstream provider.
//! Channels are owned by external configuration; the gateway loads them from
//! a JSON file and only ever reads them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Known upstream provider types. One adaptor variant per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
    Groq,
    Zhipu,
    Novita,
    /// Any OpenAI-compatible endpoint; requires `base_url`.
    Custom,
}

impl ChannelType {
    pub const ALL: [ChannelType; 7] = [
        Self::OpenAI,
        Self::Anthropic,
        Self::Gemini,
        Self::Groq,
        Self::Zhipu,
        Self::Novita,
        Self::Custom,
    ];

    /// Stable identifier, also used in `"model(channel-type)"` override keys.
    pub fn id(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Groq => "groq",
            Self::Zhipu => "zhipu",
            Self::Novita => "novita",
            Self::Custom => "custom",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }

    /// Default API base. OpenAI-compatible providers include their version
    /// prefix; the others are bare origins and adaptors add the rest.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAI => Some("https://api.openai.com/v1"),
            Self::Anthropic => Some("https://api.anthropic.com"),
            Self::Gemini => Some("https://generativelanguage.googleapis.com"),
            Self::Groq => Some("https://api.groq.com/openai/v1"),
            Self::Zhipu => Some("https://open.bigmodel.cn"),
            Self::Novita => Some("https://api.novita.ai/v3/openai"),
            Self::Custom => None,
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Per-channel pricing overrides.
///
/// Keys are either `"model(channel-type)"` or a bare model name; the
/// composite form wins when both are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatioOverrides {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub completion_ratio: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cached_input_ratio: HashMap<String, f64>,
}

impl RatioOverrides {
    pub fn is_empty(&self) -> bool {
        self.model_ratio.is_empty()
            && self.completion_ratio.is_empty()
            && self.cached_input_ratio.is_empty()
    }
}

/// A configured upstream channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    /// Overrides the provider's default origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    /// Models this channel serves. Empty means "whatever the adaptor supports".
    #[serde(default)]
    pub models: Vec<String>,
    /// Requested model name → upstream model name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub ratio_overrides: RatioOverrides,
    /// Higher priority channels are tried first.
    #[serde(default)]
    pub priority: i64,
    /// Relative weight among channels of equal priority.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub status: ChannelStatus,
}

fn default_weight() -> u32 {
    1
}

impl Channel {
    pub fn new(id: i64, channel_type: ChannelType, api_key: impl Into<String>) -> Self {
        Self {
            id,
            channel_type,
            name: format!("{}-{}", channel_type.id(), id),
            base_url: None,
            api_key: api_key.into(),
            models: Vec::new(),
            model_mapping: HashMap::new(),
            ratio_overrides: RatioOverrides::default(),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    /// Whether this channel lists `model` (an empty list serves anything).
    pub fn serves_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// The model name to send upstream for a requested model.
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    /// Effective origin without a trailing slash.
    pub fn effective_base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.channel_type.default_base_url())
            .map(|s| s.trim_end_matches('/').to_string())
    }

    /// Check fields the gateway relies on. Returns a description of the
    /// first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(base) = self.base_url.as_deref().filter(|s| !s.is_empty()) {
            url::Url::parse(base).map_err(|e| format!("invalid base_url '{}': {}", base, e))?;
        } else if self.channel_type == ChannelType::Custom {
            return Err("custom channels require a base_url".to_string());
        }
        if self.weight == 0 {
            return Err("weight must be at least 1".to_string());
        }
        let overrides = &self.ratio_overrides;
        for (key, ratio) in overrides
            .model_ratio
            .iter()
            .chain(overrides.completion_ratio.iter())
            .chain(overrides.cached_input_ratio.iter())
        {
            if !ratio.is_finite() || *ratio < 0.0 {
                return Err(format!("ratio override for '{}' must be >= 0", key));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelStoreError {
    #[error("failed to read channels file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse channels file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("channel {id}: {message}")]
    Invalid { id: i64, message: String },
    #[error("duplicate channel id {0}")]
    DuplicateId(i64),
}

/// Read-only channel store backed by a JSON file.
#[derive(Debug)]
pub struct ChannelStore {
    channels: RwLock<Arc<Vec<Channel>>>,
    storage_path: Option<PathBuf>,
}

impl ChannelStore {
    /// Build a store from an in-memory list.
    pub fn from_channels(channels: Vec<Channel>) -> Result<Self, ChannelStoreError> {
        let channels = Self::checked(channels)?;
        Ok(Self {
            channels: RwLock::new(Arc::new(channels)),
            storage_path: None,
        })
    }

    /// Load channels from a JSON array on disk. A missing file yields an
    /// empty store so the gateway can start before channels are configured.
    pub async fn load(storage_path: PathBuf) -> Result<Self, ChannelStoreError> {
        let channels = Self::read_file(&storage_path).await?;
        tracing::info!(
            path = %storage_path.display(),
            count = channels.len(),
            "Loaded channels"
        );
        Ok(Self {
            channels: RwLock::new(Arc::new(channels)),
            storage_path: Some(storage_path),
        })
    }

    /// Re-read the backing file, keeping the old list on failure.
    pub async fn reload(&self) -> Result<usize, ChannelStoreError> {
        let Some(path) = &self.storage_path else {
            return Ok(self.channels.read().await.len());
        };
        let channels = Self::read_file(path).await?;
        let count = channels.len();
        *self.channels.write().await = Arc::new(channels);
        Ok(count)
    }

    async fn read_file(path: &Path) -> Result<Vec<Channel>, ChannelStoreError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Channels file not found, starting empty");
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ChannelStoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let channels: Vec<Channel> =
            serde_json::from_str(&contents).map_err(|source| ChannelStoreError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::checked(channels)
    }

    fn checked(channels: Vec<Channel>) -> Result<Vec<Channel>, ChannelStoreError> {
        let mut seen = std::collections::HashSet::new();
        for channel in &channels {
            if !seen.insert(channel.id) {
                return Err(ChannelStoreError::DuplicateId(channel.id));
            }
            channel
                .validate()
                .map_err(|message| ChannelStoreError::Invalid {
                    id: channel.id,
                    message,
                })?;
        }
        Ok(channels)
    }

    /// Snapshot of all channels.
    pub async fn list(&self) -> Arc<Vec<Channel>> {
        self.channels.read().await.clone()
    }

    pub async fn get(&self, id: i64) -> Option<Channel> {
        self.channels
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }
}

/// Shared channel store type.
pub type SharedChannelStore = Arc<ChannelStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_ids_round_trip() {
        for t in ChannelType::ALL {
            assert_eq!(ChannelType::from_id(t.id()), Some(t));
        }
        assert_eq!(ChannelType::from_id("bedrock"), None);
    }

    #[test]
    fn deserializes_minimal_channel() {
        let json = r#"{"id": 3, "type": "anthropic", "api_key": "sk-ant"}"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.channel_type, ChannelType::Anthropic);
        assert_eq!(channel.weight, 1);
        assert!(channel.is_enabled());
        assert!(channel.serves_model("anything"));
        assert_eq!(
            channel.effective_base_url().as_deref(),
            Some("https://api.anthropic.com")
        );
    }

    #[test]
    fn model_mapping_applies() {
        let mut channel = Channel::new(1, ChannelType::OpenAI, "k");
        channel
            .model_mapping
            .insert("gpt-4o".into(), "gpt-4o-2024-11-20".into());
        assert_eq!(channel.map_model("gpt-4o"), "gpt-4o-2024-11-20");
        assert_eq!(channel.map_model("gpt-4.1"), "gpt-4.1");
    }

    #[test]
    fn custom_channel_needs_base_url() {
        let channel = Channel::new(1, ChannelType::Custom, "k");
        assert!(channel.validate().is_err());
        let mut channel = channel;
        channel.base_url = Some("http://127.0.0.1:9000/v1/".into());
        assert!(channel.validate().is_ok());
        assert_eq!(
            channel.effective_base_url().as_deref(),
            Some("http://127.0.0.1:9000/v1")
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = ChannelStore::from_channels(vec![
            Channel::new(1, ChannelType::OpenAI, "a"),
            Channel::new(1, ChannelType::Groq, "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, ChannelStoreError::DuplicateId(1)));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(
            &path,
            r#"[{"id": 7, "type": "gemini", "api_key": "g", "priority": 2, "models": ["gemini-2.5-pro"]}]"#,
        )
        .unwrap();
        let store = ChannelStore::load(path).await.unwrap();
        let channel = store.get(7).await.unwrap();
        assert_eq!(channel.priority, 2);
        assert!(channel.serves_model("gemini-2.5-pro"));
        assert!(!channel.serves_model("gemini-2.0-flash"));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::load(dir.path().join("nope.json")).await.unwrap();
        assert!(store.list().await.is_empty());
    }
}
