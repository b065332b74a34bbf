//! Canonical request/response types shared by every adaptor.
//!
//! The inbound surface is OpenAI-compatible; adaptors translate from these
//! types into each provider's wire format and back.

mod video;

pub(crate) use video::format_seconds;
pub use video::{RerankRequest, SpeechRequest, VideoJob, VideoRequest, VideoStatus};

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which endpoint a request came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Rerank,
    AudioSpeech,
    VideoGeneration,
    VideoFetch,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Rerank => "rerank",
            Self::AudioSpeech => "audio_speech",
            Self::VideoGeneration => "video_generation",
            Self::VideoFetch => "video_fetch",
        }
    }

    /// Modes whose reply starts an upstream job polled later.
    pub fn creates_task(&self) -> bool {
        matches!(self, Self::VideoGeneration)
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "developer")]
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Content part for multimodal messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    /// "auto", "low" or "high"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url_with_detail(url: impl Into<String>, detail: Option<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail,
            },
        }
    }
}

/// Message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(text.into())
    }

    /// All text parts joined, images skipped.
    pub fn joined_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(s) => vec![ContentPart::Text { text: s }],
            MessageContent::Parts(parts) => parts,
        }
    }
}

/// Where reasoning text is placed in a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningFormat {
    Reasoning,
    Thinking,
    #[default]
    ReasoningContent,
}

impl ReasoningFormat {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Thinking => "thinking",
            Self::ReasoningContent => "reasoning_content",
        }
    }
}

/// A message in a chat conversation.
///
/// At most one of the three reasoning fields is set on messages the gateway
/// produces; use [`ChatMessage::set_reasoning`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::text(content)),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
            thinking: None,
            reasoning_content: None,
        }
    }

    pub fn assistant_empty() -> Self {
        let mut m = Self::new(Role::Assistant, "");
        m.content = None;
        m
    }

    pub fn text(&self) -> String {
        self.content
            .as_ref()
            .map(MessageContent::joined_text)
            .unwrap_or_default()
    }

    /// Store reasoning under the requested field and clear the other two.
    pub fn set_reasoning(&mut self, format: ReasoningFormat, text: impl Into<String>) {
        let text = text.into();
        self.reasoning = None;
        self.thinking = None;
        self.reasoning_content = None;
        if text.is_empty() {
            return;
        }
        match format {
            ReasoningFormat::Reasoning => self.reasoning = Some(text),
            ReasoningFormat::Thinking => self.thinking = Some(text),
            ReasoningFormat::ReasoningContent => self.reasoning_content = Some(text),
        }
    }

    /// Reasoning from whichever field carries it (inbound history may use any).
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
            .or(self.thinking.as_deref())
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON string.
    #[serde(default)]
    pub arguments: String,
}

/// Incremental tool call in a stream chunk.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    pub function: FunctionCallDelta,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct FunctionCallDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

/// Sampling and tool parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop: Vec<String>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<Value>,
    /// Budget for provider-side thinking, when the provider supports one.
    pub thinking_budget: Option<u64>,
}

/// `stop` may be a single string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StopField {
    One(String),
    Many(Vec<String>),
}

impl StopField {
    fn into_vec(self) -> Vec<String> {
        match self {
            StopField::One(s) => vec![s],
            StopField::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ThinkingField {
    #[serde(default)]
    budget_tokens: Option<u64>,
}

/// Inbound `/v1/chat/completions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    max_completion_tokens: Option<u64>,
    #[serde(default)]
    stop: Option<StopField>,
    #[serde(default)]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    tool_choice: Option<Value>,
    #[serde(default)]
    reasoning_format: Option<ReasoningFormat>,
    #[serde(default)]
    thinking: Option<ThinkingField>,
}

/// `prompt` may be a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PromptField {
    One(String),
    Many(Vec<String>),
}

/// Inbound `/v1/completions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    prompt: PromptField,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    #[serde(default)]
    stop: Option<StopField>,
}

/// Provider-neutral request handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub mode: RelayMode,
    /// Model the caller asked for; billing always uses this name.
    pub model: String,
    pub stream: bool,
    pub messages: Vec<ChatMessage>,
    /// Legacy completion prompt.
    pub prompt: Option<String>,
    pub params: GenerationParams,
    pub reasoning_format: ReasoningFormat,
    pub rerank: Option<RerankRequest>,
    pub speech: Option<SpeechRequest>,
    pub video: Option<VideoRequest>,
    /// Task id for video polls.
    pub task_id: Option<String>,
}

impl CanonicalRequest {
    fn empty(mode: RelayMode, model: impl Into<String>) -> Self {
        Self {
            mode,
            model: model.into(),
            stream: false,
            messages: Vec::new(),
            prompt: None,
            params: GenerationParams::default(),
            reasoning_format: ReasoningFormat::default(),
            rerank: None,
            speech: None,
            video: None,
            task_id: None,
        }
    }

    pub fn chat(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        let mut req = Self::empty(RelayMode::ChatCompletions, model);
        req.messages = messages;
        req
    }

    pub fn rerank(rerank: RerankRequest) -> Self {
        let mut req = Self::empty(RelayMode::Rerank, rerank.model.clone());
        req.rerank = Some(rerank);
        req
    }

    pub fn speech(speech: SpeechRequest) -> Self {
        let mut req = Self::empty(RelayMode::AudioSpeech, speech.model.clone());
        req.speech = Some(speech);
        req
    }

    /// `model` is the already-defaulted model name.
    pub fn video(model: impl Into<String>, video: VideoRequest) -> Self {
        let mut req = Self::empty(RelayMode::VideoGeneration, model);
        req.video = Some(video);
        req
    }

    pub fn video_fetch(model: impl Into<String>, task_id: impl Into<String>) -> Self {
        let mut req = Self::empty(RelayMode::VideoFetch, model);
        req.task_id = Some(task_id.into());
        req
    }

    /// Rough prompt size used when an upstream reports no usage.
    pub fn estimate_prompt_tokens(&self) -> u64 {
        let mut chars = 0usize;
        for m in &self.messages {
            chars += m.text().chars().count();
        }
        if let Some(p) = &self.prompt {
            chars += p.chars().count();
        }
        if let Some(r) = &self.rerank {
            chars += r.query.chars().count();
            chars += r.documents.iter().map(|d| d.chars().count()).sum::<usize>();
        }
        if let Some(s) = &self.speech {
            chars += s.input.chars().count();
        }
        estimate_tokens_for_chars(chars)
    }
}

impl From<ChatCompletionRequest> for CanonicalRequest {
    fn from(r: ChatCompletionRequest) -> Self {
        let mut req = CanonicalRequest::chat(r.model, r.messages);
        req.stream = r.stream;
        req.reasoning_format = r.reasoning_format.unwrap_or_default();
        req.params = GenerationParams {
            temperature: r.temperature,
            top_p: r.top_p,
            max_tokens: r.max_completion_tokens.or(r.max_tokens),
            stop: r.stop.map(StopField::into_vec).unwrap_or_default(),
            tools: r.tools.unwrap_or_default(),
            tool_choice: r.tool_choice,
            thinking_budget: r.thinking.and_then(|t| t.budget_tokens),
        };
        req
    }
}

impl From<CompletionRequest> for CanonicalRequest {
    fn from(r: CompletionRequest) -> Self {
        let mut req = CanonicalRequest::empty(RelayMode::Completions, r.model);
        req.stream = r.stream;
        req.prompt = Some(match r.prompt {
            PromptField::One(s) => s,
            PromptField::Many(v) => v.join("\n"),
        });
        req.params = GenerationParams {
            temperature: r.temperature,
            top_p: r.top_p,
            max_tokens: r.max_tokens,
            stop: r.stop.map(StopField::into_vec).unwrap_or_default(),
            ..GenerationParams::default()
        };
        req
    }
}

/// Token usage for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Subset of `prompt_tokens` served from a provider cache.
    pub cached_prompt_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_prompt_tokens: 0,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    /// OpenAI-style `usage` object.
    pub fn to_openai_json(&self) -> Value {
        let mut v = json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total_tokens(),
        });
        if self.cached_prompt_tokens > 0 {
            v["prompt_tokens_details"] = json!({ "cached_tokens": self.cached_prompt_tokens });
        }
        v
    }

    /// Parse an OpenAI-compatible `usage` object.
    pub fn from_openai_json(v: &Value) -> Option<Self> {
        let prompt = v.get("prompt_tokens")?.as_u64()?;
        let completion = v
            .get("completion_tokens")
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        let cached = v
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .or_else(|| v.get("prompt_cache_hit_tokens"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        Some(Self {
            prompt_tokens: prompt,
            completion_tokens: completion,
            cached_prompt_tokens: cached,
        })
    }
}

/// Four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_for_chars(text.chars().count())
}

fn estimate_tokens_for_chars(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankResult {
    pub index: u32,
    pub relevance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

/// Mode-specific reply payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutput {
    Chat(Vec<ChatChoice>),
    Text(Vec<TextChoice>),
    Rerank(Vec<RerankResult>),
    Speech { content_type: String, audio: Bytes },
    Video(VideoJob),
}

/// Provider-neutral reply.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub output: ResponseOutput,
    pub usage: Option<Usage>,
    /// Set when the upstream started an async job.
    pub task_id: Option<String>,
}

impl CanonicalResponse {
    pub fn new(model: impl Into<String>, output: ResponseOutput) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            output,
            usage: None,
            task_id: None,
        }
    }

    /// OpenAI-compatible JSON body. `None` for binary speech replies.
    pub fn to_openai_json(&self) -> Option<Value> {
        let usage = self.usage.map(|u| u.to_openai_json());
        let body = match &self.output {
            ResponseOutput::Chat(choices) => json!({
                "id": self.id,
                "object": "chat.completion",
                "created": self.created,
                "model": self.model,
                "choices": choices.iter().map(|c| json!({
                    "index": c.index,
                    "message": c.message,
                    "finish_reason": c.finish_reason,
                })).collect::<Vec<_>>(),
                "usage": usage,
            }),
            ResponseOutput::Text(choices) => json!({
                "id": self.id,
                "object": "text_completion",
                "created": self.created,
                "model": self.model,
                "choices": choices.iter().map(|c| json!({
                    "index": c.index,
                    "text": c.text,
                    "finish_reason": c.finish_reason,
                })).collect::<Vec<_>>(),
                "usage": usage,
            }),
            ResponseOutput::Rerank(results) => json!({
                "id": self.id,
                "model": self.model,
                "results": results,
                "usage": usage,
            }),
            ResponseOutput::Video(job) => job.to_openai_json(),
            ResponseOutput::Speech { .. } => return None,
        };
        Some(body)
    }
}

/// Incremental delta in a streamed reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    /// Reasoning text; placed under the request's reasoning field on output.
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

/// One parsed streaming chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            delta: ChunkDelta {
                content: Some(text.into()),
                ..ChunkDelta::default()
            },
            ..Self::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            delta: ChunkDelta {
                reasoning: Some(text.into()),
                ..ChunkDelta::default()
            },
            ..Self::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn usage_only(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    /// Characters of generated output carried by this chunk.
    pub fn output_chars(&self) -> usize {
        let mut n = 0;
        if let Some(c) = &self.delta.content {
            n += c.chars().count();
        }
        if let Some(r) = &self.delta.reasoning {
            n += r.chars().count();
        }
        for t in &self.delta.tool_calls {
            if let Some(a) = &t.function.arguments {
                n += a.chars().count();
            }
        }
        n
    }
}

/// Shared fields for rendering stream chunks as OpenAI SSE payloads.
#[derive(Debug, Clone)]
pub struct ChunkEnvelope {
    pub id: String,
    pub model: String,
    pub created: i64,
    pub mode: RelayMode,
    pub reasoning_format: ReasoningFormat,
}

impl ChunkEnvelope {
    pub fn new(model: impl Into<String>, mode: RelayMode, reasoning_format: ReasoningFormat) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            mode,
            reasoning_format,
        }
    }

    pub fn render(&self, chunk: &StreamChunk) -> Value {
        let choice = if self.mode == RelayMode::Completions {
            json!({
                "index": chunk.index,
                "text": chunk.delta.content.clone().unwrap_or_default(),
                "finish_reason": chunk.finish_reason,
            })
        } else {
            let mut delta = serde_json::Map::new();
            if let Some(role) = chunk.delta.role {
                delta.insert("role".into(), json!(role));
            }
            if let Some(content) = &chunk.delta.content {
                delta.insert("content".into(), json!(content));
            }
            if let Some(reasoning) = &chunk.delta.reasoning {
                delta.insert(
                    self.reasoning_format.field_name().into(),
                    json!(reasoning),
                );
            }
            if !chunk.delta.tool_calls.is_empty() {
                delta.insert("tool_calls".into(), json!(chunk.delta.tool_calls));
            }
            json!({
                "index": chunk.index,
                "delta": delta,
                "finish_reason": chunk.finish_reason,
            })
        };
        let object = if self.mode == RelayMode::Completions {
            "text_completion"
        } else {
            "chat.completion.chunk"
        };
        let mut v = json!({
            "id": self.id,
            "object": object,
            "created": self.created,
            "model": self.model,
            "choices": [choice],
        });
        if let Some(usage) = chunk.usage {
            v["usage"] = usage.to_openai_json();
        }
        v
    }
}

/// Collects streamed JSON fragments per block index and releases each
/// block's complete text exactly once.
#[derive(Debug, Default)]
pub struct FragmentAccumulator {
    blocks: BTreeMap<u32, String>,
}

impl FragmentAccumulator {
    pub fn push(&mut self, index: u32, fragment: &str) {
        self.blocks.entry(index).or_default().push_str(fragment);
    }

    /// Remove and return a finished block.
    pub fn take(&mut self, index: u32) -> Option<String> {
        self.blocks.remove(&index)
    }

    /// Remove every remaining block in index order.
    pub fn drain(&mut self) -> Vec<(u32, String)> {
        std::mem::take(&mut self.blocks).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_request_with_parts_and_stop() {
        let body = json!({
            "model": "gpt-4o",
            "stream": true,
            "stop": "END",
            "max_completion_tokens": 64,
            "reasoning_format": "thinking",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is this?"},
                    {"type": "image_url", "image_url": {"url": "https://x/y.png", "detail": "high"}}
                ]}
            ]
        });
        let req: CanonicalRequest = serde_json::from_value::<ChatCompletionRequest>(body)
            .unwrap()
            .into();
        assert!(req.stream);
        assert_eq!(req.params.stop, vec!["END".to_string()]);
        assert_eq!(req.params.max_tokens, Some(64));
        assert_eq!(req.reasoning_format, ReasoningFormat::Thinking);
        match req.messages[1].content.as_ref().unwrap() {
            MessageContent::Parts(parts) => match &parts[1] {
                ContentPart::ImageUrl { image_url } => {
                    assert_eq!(image_url.detail.as_deref(), Some("high"))
                }
                other => panic!("unexpected part {other:?}"),
            },
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn set_reasoning_keeps_exactly_one_field() {
        let mut m = ChatMessage::assistant_empty();
        m.set_reasoning(ReasoningFormat::Reasoning, "a");
        m.set_reasoning(ReasoningFormat::Thinking, "b");
        assert_eq!(m.reasoning, None);
        assert_eq!(m.thinking.as_deref(), Some("b"));
        assert_eq!(m.reasoning_content, None);

        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("reasoning").is_none());
        assert!(v.get("reasoning_content").is_none());
    }

    #[test]
    fn chunk_reasoning_uses_requested_field() {
        let env = ChunkEnvelope::new("m", RelayMode::ChatCompletions, ReasoningFormat::Reasoning);
        let v = env.render(&StreamChunk::reasoning("hmm"));
        assert_eq!(v["choices"][0]["delta"]["reasoning"], "hmm");
        assert!(v["choices"][0]["delta"].get("reasoning_content").is_none());
    }

    #[test]
    fn estimates_four_chars_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        let req = CanonicalRequest::chat("m", vec![ChatMessage::new(Role::User, "12345678")]);
        assert_eq!(req.estimate_prompt_tokens(), 2);
    }

    #[test]
    fn usage_json_round_trip_with_cache() {
        let v = json!({"prompt_tokens": 10, "completion_tokens": 5, "prompt_tokens_details": {"cached_tokens": 4}});
        let u = Usage::from_openai_json(&v).unwrap();
        assert_eq!(u.cached_prompt_tokens, 4);
        assert_eq!(u.to_openai_json()["total_tokens"], 15);
    }

    #[test]
    fn fragments_collapse_per_block() {
        let mut acc = FragmentAccumulator::default();
        acc.push(1, "{\"ci");
        acc.push(2, "{}");
        acc.push(1, "ty\":\"Paris\"}");
        assert_eq!(acc.take(1).as_deref(), Some("{\"city\":\"Paris\"}"));
        assert_eq!(acc.take(1), None);
        assert_eq!(acc.drain(), vec![(2, "{}".to_string())]);
    }
}
