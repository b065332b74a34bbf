//! Anthropic Messages API.

use std::collections::HashMap;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::openai_compat::parse_json;
use super::sse::SseFrame;
use super::{frame_json, header_value, Adaptor, StreamParser, UpstreamBody, UpstreamTarget};
use crate::channel::{Channel, ChannelType};
use crate::error::RelayError;
use crate::relay::{
    CanonicalRequest, CanonicalResponse, ChatChoice, ChatMessage, ChunkDelta, ContentPart,
    FragmentAccumulator, FunctionCall, FunctionCallDelta, MessageContent, RelayMode,
    ResponseOutput, Role, StreamChunk, ToolCall, ToolCallDelta, Usage,
};

const API_VERSION: &str = "2023-06-01";
/// Anthropic requires `max_tokens`; used when the caller sets none.
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicAdaptor;

impl AnthropicAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnthropicAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Adaptor for AnthropicAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Anthropic
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        _request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        Ok(format!("{}/v1/messages", target.base_url()?))
    }

    fn auth_headers(&self, channel: &Channel) -> Result<HeaderMap, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", header_value(&channel.api_key)?);
        headers.insert("anthropic-version", header_value(API_VERSION)?);
        Ok(headers)
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        Ok(UpstreamBody::Json(build_messages_body(request, target.model)))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        parse_messages_response(&parse_json(&body)?, request)
    }

    fn stream_parser(&self, _request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(AnthropicStreamParser::default())
    }
}

fn build_messages_body(request: &CanonicalRequest, model: &str) -> Value {
    let system = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(ChatMessage::text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    // Anthropic wants strictly alternating roles, so consecutive messages
    // of the same role are merged into one content array.
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = message_blocks(message);
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    let params = &request.params;
    let mut max_tokens = params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert(
        "messages".into(),
        json!(messages
            .into_iter()
            .map(|(role, content)| json!({ "role": role, "content": content }))
            .collect::<Vec<_>>()),
    );
    if !system.is_empty() {
        body.insert("system".into(), json!(system));
    }
    match params.thinking_budget {
        Some(budget) => {
            if max_tokens <= budget {
                max_tokens = budget + DEFAULT_MAX_TOKENS;
            }
            body.insert(
                "thinking".into(),
                json!({ "type": "enabled", "budget_tokens": budget }),
            );
        }
        None => {
            // Sampling overrides are rejected while thinking is enabled.
            if let Some(t) = params.temperature {
                body.insert("temperature".into(), json!(t));
            }
            if let Some(p) = params.top_p {
                body.insert("top_p".into(), json!(p));
            }
        }
    }
    body.insert("max_tokens".into(), json!(max_tokens));
    if !params.stop.is_empty() {
        body.insert("stop_sequences".into(), json!(params.stop));
    }
    if !params.tools.is_empty() {
        let tools: Vec<Value> = params
            .tools
            .iter()
            .map(|t| {
                let schema = if t.function.parameters.is_null() {
                    json!({ "type": "object", "properties": {} })
                } else {
                    t.function.parameters.clone()
                };
                let mut tool = json!({ "name": t.function.name, "input_schema": schema });
                if let Some(d) = &t.function.description {
                    tool["description"] = json!(d);
                }
                tool
            })
            .collect();
        body.insert("tools".into(), json!(tools));
    }
    if let Some(choice) = params.tool_choice.as_ref().and_then(tool_choice) {
        body.insert("tool_choice".into(), choice);
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
    }
    Value::Object(body)
}

fn tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" => Some(json!({ "type": "any" })),
            "none" => Some(json!({ "type": "none" })),
            _ => None,
        },
        Value::Object(_) => choice
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .map(|name| json!({ "type": "tool", "name": name })),
        _ => None,
    }
}

fn message_blocks(message: &ChatMessage) -> (&'static str, Vec<Value>) {
    match message.role {
        Role::Tool => (
            "user",
            vec![json!({
                "type": "tool_result",
                "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                "content": message.text(),
            })],
        ),
        Role::Assistant => {
            let mut blocks = Vec::new();
            let text = message.text();
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
            for call in message.tool_calls.iter().flatten() {
                let input = serde_json::from_str::<Value>(&call.function.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
            ("assistant", blocks)
        }
        _ => {
            let blocks = message
                .content
                .clone()
                .map(MessageContent::into_parts)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } if text.is_empty() => None,
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::ImageUrl { image_url } => Some(image_block(&image_url.url)),
                })
                .collect();
            ("user", blocks)
        }
    }
}

fn image_block(url: &str) -> Value {
    match split_data_url(url) {
        Some((media_type, data)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
        None => json!({
            "type": "image",
            "source": { "type": "url", "url": url },
        }),
    }
}

/// `data:<mime>;base64,<payload>` → (mime, payload).
pub(crate) fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, data))
}

fn finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl AnthropicUsage {
    fn prompt_tokens(&self) -> u64 {
        self.input_tokens.unwrap_or(0)
            + self.cache_read_input_tokens.unwrap_or(0)
            + self.cache_creation_input_tokens.unwrap_or(0)
    }

    fn to_usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens(),
            completion_tokens: self.output_tokens.unwrap_or(0),
            cached_prompt_tokens: self.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

fn parse_messages_response(
    v: &Value,
    request: &CanonicalRequest,
) -> Result<CanonicalResponse, RelayError> {
    let blocks = v
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| RelayError::Parse("messages response has no content".into()))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or("")),
            Some("thinking") => reasoning
                .push_str(block.get("thinking").and_then(|t| t.as_str()).unwrap_or("")),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default()
                    .to_string(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: block
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    arguments: block
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                },
            }),
            _ => {}
        }
    }

    let mut message = ChatMessage::assistant_empty();
    if !text.is_empty() || tool_calls.is_empty() {
        message.content = Some(MessageContent::text(text));
    }
    if !tool_calls.is_empty() {
        message.tool_calls = Some(tool_calls);
    }
    message.set_reasoning(request.reasoning_format, reasoning);

    let mut response = CanonicalResponse::new(
        request.model.clone(),
        ResponseOutput::Chat(vec![ChatChoice {
            index: 0,
            message,
            finish_reason: v
                .get("stop_reason")
                .and_then(|s| s.as_str())
                .map(finish_reason),
        }]),
    );
    if let Some(id) = v.get("id").and_then(|i| i.as_str()) {
        response.id = id.to_string();
    }
    response.usage = v
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value::<AnthropicUsage>(u).ok())
        .map(|u| u.to_usage());
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: BlockInfo,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Tool-use block being streamed.
struct PendingTool {
    ordinal: u32,
    id: String,
    name: String,
}

/// Anthropic streams tool arguments as `input_json_delta` fragments; they
/// are buffered per content block and released as a single tool call delta
/// when the block closes.
#[derive(Default)]
struct AnthropicStreamParser {
    tools: HashMap<u32, PendingTool>,
    fragments: FragmentAccumulator,
    usage: Usage,
}

impl StreamParser for AnthropicStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamChunk>, RelayError> {
        let Some(v) = frame_json(frame)? else {
            return Ok(Vec::new());
        };
        let event: StreamEvent = serde_json::from_value(v)
            .map_err(|e| RelayError::Parse(format!("invalid anthropic event: {}", e)))?;

        let chunks = match event {
            StreamEvent::MessageStart { message } => {
                if let Some(u) = message.usage {
                    self.usage.prompt_tokens = u.prompt_tokens();
                    self.usage.cached_prompt_tokens = u.cache_read_input_tokens.unwrap_or(0);
                }
                vec![StreamChunk {
                    delta: ChunkDelta {
                        role: Some(Role::Assistant),
                        ..ChunkDelta::default()
                    },
                    ..StreamChunk::default()
                }]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if content_block.block_type == "tool_use" {
                    let ordinal = self.tools.len() as u32;
                    self.tools.insert(
                        index,
                        PendingTool {
                            ordinal,
                            id: content_block.id.unwrap_or_default(),
                            name: content_block.name.unwrap_or_default(),
                        },
                    );
                    self.fragments.push(index, "");
                }
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta.delta_type.as_str() {
                "text_delta" => delta
                    .text
                    .filter(|t| !t.is_empty())
                    .map(StreamChunk::content)
                    .into_iter()
                    .collect(),
                "thinking_delta" => delta
                    .thinking
                    .filter(|t| !t.is_empty())
                    .map(StreamChunk::reasoning)
                    .into_iter()
                    .collect(),
                "input_json_delta" => {
                    if let Some(fragment) = delta.partial_json {
                        self.fragments.push(index, &fragment);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => {
                match (self.tools.get(&index), self.fragments.take(index)) {
                    (Some(tool), Some(arguments)) => {
                        let arguments = if arguments.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            arguments
                        };
                        vec![StreamChunk {
                            delta: ChunkDelta {
                                tool_calls: vec![ToolCallDelta {
                                    index: tool.ordinal,
                                    id: Some(tool.id.clone()),
                                    call_type: Some("function".to_string()),
                                    function: FunctionCallDelta {
                                        name: Some(tool.name.clone()),
                                        arguments: Some(arguments),
                                    },
                                }],
                                ..ChunkDelta::default()
                            },
                            ..StreamChunk::default()
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    if let Some(out) = u.output_tokens {
                        self.usage.completion_tokens = out;
                    }
                    if u.input_tokens.is_some() {
                        self.usage.prompt_tokens = u.prompt_tokens();
                        self.usage.cached_prompt_tokens = u.cache_read_input_tokens.unwrap_or(0);
                    }
                }
                vec![StreamChunk {
                    finish_reason: delta.stop_reason.as_deref().map(finish_reason),
                    usage: Some(self.usage),
                    ..StreamChunk::default()
                }]
            }
            StreamEvent::Other => Vec::new(),
        };
        Ok(chunks)
    }
}
