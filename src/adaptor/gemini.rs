//! Google Gemini `generateContent` API.

use std::collections::HashMap;

use bytes::Bytes;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::{json, Map, Value};

use super::anthropic::split_data_url;
use super::openai_compat::parse_json;
use super::sse::SseFrame;
use super::{frame_json, header_value, Adaptor, StreamParser, UpstreamBody, UpstreamTarget};
use crate::channel::{Channel, ChannelType};
use crate::error::RelayError;
use crate::relay::{
    CanonicalRequest, CanonicalResponse, ChatChoice, ChatMessage, ChunkDelta, ContentPart,
    FunctionCall, FunctionCallDelta, MessageContent, RelayMode, ResponseOutput, Role, StreamChunk,
    ToolCall, ToolCallDelta, Usage,
};

/// Models only served on the beta API surface.
const BETA_MODEL_PATTERN: &str = r"^gemini-[23]|-thinking|-exp|-preview";

pub struct GeminiAdaptor {
    default_version: String,
    beta_models: Regex,
}

impl GeminiAdaptor {
    pub fn new(default_version: &str) -> Result<Self, RelayError> {
        let beta_models = Regex::new(BETA_MODEL_PATTERN)
            .map_err(|e| RelayError::Configuration(format!("invalid gemini model pattern: {}", e)))?;
        Ok(Self {
            default_version: default_version.to_string(),
            beta_models,
        })
    }

    fn api_version(&self, model: &str) -> &str {
        if self.beta_models.is_match(model) {
            "v1beta"
        } else {
            &self.default_version
        }
    }
}

impl Adaptor for GeminiAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Gemini
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("gemini-") || model.starts_with("gemma-")
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        let action = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(format!(
            "{}/{}/models/{}:{}",
            target.base_url()?,
            self.api_version(target.model),
            target.model,
            action
        ))
    }

    fn auth_headers(&self, channel: &Channel) -> Result<HeaderMap, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", header_value(&channel.api_key)?);
        Ok(headers)
    }

    fn build_request(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        Ok(UpstreamBody::Json(build_generate_request(request)))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        parse_generate_response(&parse_json(&body)?, request)
    }

    fn stream_parser(&self, _request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(GeminiStreamParser::default())
    }
}

fn build_generate_request(request: &CanonicalRequest) -> Value {
    let mut contents: Vec<Value> = Vec::new();
    let mut system_text_parts: Vec<String> = Vec::new();
    // functionResponse parts need the function name, which OpenAI tool
    // messages only carry by call id.
    let mut call_names: HashMap<&str, &str> = HashMap::new();

    for message in &request.messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                system_text_parts.push(text);
            }
            continue;
        }

        let gemini_role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let mut parts: Vec<Value> = if message.role == Role::Tool {
            Vec::new()
        } else {
            content_parts(message.content.as_ref())
        };

        for call in message.tool_calls.iter().flatten() {
            call_names.insert(call.id.as_str(), call.function.name.as_str());
            let args = serde_json::from_str::<Value>(&call.function.arguments)
                .unwrap_or_else(|_| json!({}));
            parts.push(json!({
                "functionCall": { "name": call.function.name, "args": args },
                "thoughtSignature": "skip_thought_signature_validator",
            }));
        }

        if message.role == Role::Tool {
            let name = message
                .tool_call_id
                .as_deref()
                .and_then(|id| call_names.get(id).copied())
                .or(message.name.as_deref())
                .unwrap_or("tool");
            parts.push(json!({
                "functionResponse": {
                    "name": name,
                    "response": { "output": message.text() },
                }
            }));
        }

        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": gemini_role, "parts": parts }));
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));
    if !system_text_parts.is_empty() {
        body.insert(
            "systemInstruction".into(),
            json!({
                "parts": system_text_parts
                    .into_iter()
                    .map(|t| json!({ "text": t }))
                    .collect::<Vec<_>>(),
            }),
        );
    }

    let params = &request.params;
    let mut generation_config = Map::new();
    if let Some(v) = params.temperature {
        generation_config.insert("temperature".into(), json!(v));
    }
    if let Some(v) = params.top_p {
        generation_config.insert("topP".into(), json!(v));
    }
    if let Some(v) = params.max_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(v));
    }
    if !params.stop.is_empty() {
        generation_config.insert("stopSequences".into(), json!(params.stop));
    }
    if let Some(budget) = params.thinking_budget {
        generation_config.insert(
            "thinkingConfig".into(),
            json!({ "thinkingBudget": budget, "includeThoughts": true }),
        );
    }
    if !generation_config.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation_config));
    }

    let declarations: Vec<Value> = params
        .tools
        .iter()
        .filter(|t| t.tool_type == "function")
        .map(|t| {
            let mut decl = json!({ "name": t.function.name });
            if let Some(d) = &t.function.description {
                decl["description"] = json!(d);
            }
            if !t.function.parameters.is_null() {
                decl["parameters"] = t.function.parameters.clone();
            }
            decl
        })
        .collect();
    if !declarations.is_empty() {
        body.insert(
            "tools".into(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }

    if let Some(cfg) = params.tool_choice.as_ref().and_then(tool_config) {
        body.insert("toolConfig".into(), cfg);
    }
    Value::Object(body)
}

fn tool_config(choice: &Value) -> Option<Value> {
    if let Some(s) = choice.as_str() {
        return match s {
            "none" => Some(json!({ "functionCallingConfig": { "mode": "NONE" } })),
            "required" => Some(json!({ "functionCallingConfig": { "mode": "ANY" } })),
            _ => None,
        };
    }
    choice
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(|v| v.as_str())
        .map(|name| {
            json!({
                "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
            })
        })
}

fn content_parts(content: Option<&MessageContent>) -> Vec<Value> {
    let Some(content) = content else {
        return Vec::new();
    };
    content
        .clone()
        .into_parts()
        .into_iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(json!({ "text": text })),
            ContentPart::ImageUrl { image_url } => {
                let mut part = match split_data_url(&image_url.url) {
                    Some((mime, data)) => {
                        json!({ "inlineData": { "mimeType": mime, "data": data } })
                    }
                    None => json!({
                        "fileData": { "mimeType": guess_image_mime(&image_url.url), "fileUri": image_url.url }
                    }),
                };
                if let Some(level) = image_url.detail.as_deref().and_then(media_resolution) {
                    part["mediaResolution"] = json!({ "level": level });
                }
                Some(part)
            }
        })
        .collect()
}

fn media_resolution(detail: &str) -> Option<&'static str> {
    match detail {
        "low" => Some("MEDIA_RESOLUTION_LOW"),
        "high" => Some("MEDIA_RESOLUTION_HIGH"),
        _ => None,
    }
}

fn guess_image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

fn finish_reason_from_google(s: Option<&str>) -> &'static str {
    match s.unwrap_or("STOP") {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

fn usage_from_metadata(v: &Value) -> Option<Usage> {
    let meta = v.get("usageMetadata")?;
    let count = |k: &str| meta.get(k).and_then(|c| c.as_u64()).unwrap_or(0);
    Some(Usage {
        prompt_tokens: count("promptTokenCount"),
        completion_tokens: count("candidatesTokenCount") + count("thoughtsTokenCount"),
        cached_prompt_tokens: count("cachedContentTokenCount"),
    })
}

fn candidate_parts(candidate: &Value) -> &[Value] {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn is_thought(part: &Value) -> bool {
    part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false)
}

fn parse_generate_response(
    v: &Value,
    request: &CanonicalRequest,
) -> Result<CanonicalResponse, RelayError> {
    let candidate = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| RelayError::Parse("gemini response missing candidates".into()))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for (idx, part) in candidate_parts(candidate).iter().enumerate() {
        if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
            if is_thought(part) {
                reasoning.push_str(t);
            } else {
                text.push_str(t);
            }
        }
        if let Some(fc) = part.get("functionCall") {
            tool_calls.push(ToolCall {
                id: format!("call_{}", idx),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: fc
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("tool")
                        .to_string(),
                    arguments: fc
                        .get("args")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                },
            });
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        finish_reason_from_google(candidate.get("finishReason").and_then(|f| f.as_str()))
    } else {
        "tool_calls"
    };
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
            finish_reason: Some(finish_reason.to_string()),
        }]),
    );
    response.usage = usage_from_metadata(v);
    Ok(response)
}

/// Gemini streams whole response objects; usage metadata is cumulative, so
/// only the last one seen is reported.
#[derive(Default)]
struct GeminiStreamParser {
    sent_role: bool,
    tool_calls: u32,
    usage: Option<Usage>,
}

impl StreamParser for GeminiStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamChunk>, RelayError> {
        let Some(v) = frame_json(frame)? else {
            return Ok(Vec::new());
        };
        if let Some(usage) = usage_from_metadata(&v) {
            self.usage = Some(usage);
        }
        let Some(candidate) = v
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Ok(Vec::new());
        };

        let mut chunks = Vec::new();
        if !self.sent_role {
            self.sent_role = true;
            chunks.push(StreamChunk {
                delta: ChunkDelta {
                    role: Some(Role::Assistant),
                    ..ChunkDelta::default()
                },
                ..StreamChunk::default()
            });
        }
        for part in candidate_parts(candidate) {
            if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                if !t.is_empty() {
                    chunks.push(if is_thought(part) {
                        StreamChunk::reasoning(t)
                    } else {
                        StreamChunk::content(t)
                    });
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let index = self.tool_calls;
                self.tool_calls += 1;
                chunks.push(StreamChunk {
                    delta: ChunkDelta {
                        tool_calls: vec![ToolCallDelta {
                            index,
                            id: Some(format!("call_{}", index)),
                            call_type: Some("function".to_string()),
                            function: FunctionCallDelta {
                                name: fc.get("name").and_then(|n| n.as_str()).map(str::to_string),
                                arguments: Some(
                                    fc.get("args")
                                        .map(Value::to_string)
                                        .unwrap_or_else(|| "{}".to_string()),
                                ),
                            },
                        }],
                        ..ChunkDelta::default()
                    },
                    ..StreamChunk::default()
                });
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|f| f.as_str()) {
            let reason = if self.tool_calls > 0 {
                "tool_calls"
            } else {
                finish_reason_from_google(Some(reason))
            };
            chunks.push(StreamChunk::finish(reason));
        }
        Ok(chunks)
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        self.usage.take().map(StreamChunk::usage_only).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{FunctionDefinition, ImageUrl, ReasoningFormat, ToolDefinition};

    fn frame(v: Value) -> SseFrame {
        SseFrame {
            event: None,
            data: v.to_string(),
            extra: vec![],
        }
    }

    #[test]
    fn picks_api_version_by_model() {
        let adaptor = GeminiAdaptor::new("v1").unwrap();
        assert_eq!(adaptor.api_version("gemini-2.5-pro"), "v1beta");
        assert_eq!(adaptor.api_version("gemini-1.5-flash-exp"), "v1beta");
        assert_eq!(adaptor.api_version("gemini-1.5-flash"), "v1");

        let ch = Channel::new(1, ChannelType::Gemini, "key");
        let target = UpstreamTarget {
            channel: &ch,
            model: "gemini-2.5-flash",
        };
        let mut req = CanonicalRequest::chat("gemini-2.5-flash", vec![]);
        req.stream = true;
        assert_eq!(
            adaptor.request_url(&target, &req).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn builds_contents_tools_and_images() {
        let mut assistant = ChatMessage::assistant_empty();
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_a".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "lookup".into(),
                arguments: "{\"q\":1}".into(),
            },
        }]);
        let mut tool = ChatMessage::new(Role::Tool, "found");
        tool.tool_call_id = Some("call_a".into());
        let mut req = CanonicalRequest::chat(
            "gemini-2.5-pro",
            vec![
                ChatMessage::new(Role::System, "sys"),
                ChatMessage {
                    content: Some(MessageContent::Parts(vec![
                        ContentPart::text("look"),
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: "https://x/cat.PNG".into(),
                                detail: Some("high".into()),
                            },
                        },
                    ])),
                    ..ChatMessage::new(Role::User, "")
                },
                assistant,
                tool,
            ],
        );
        req.params.tools = vec![ToolDefinition {
            tool_type: "function".into(),
            function: FunctionDefinition {
                name: "lookup".into(),
                description: Some("find".into()),
                parameters: json!({"type": "object"}),
            },
        }];
        req.params.tool_choice = Some(json!({"type": "function", "function": {"name": "lookup"}}));
        req.params.thinking_budget = Some(1024);

        let body = build_generate_request(&req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        let image = &contents[0]["parts"][1];
        assert_eq!(image["fileData"]["mimeType"], "image/png");
        assert_eq!(image["mediaResolution"]["level"], "MEDIA_RESOLUTION_HIGH");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["q"], 1);
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "lookup");
        assert_eq!(
            body["toolConfig"]["functionCallingConfig"]["allowedFunctionNames"][0],
            "lookup"
        );
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 1024);
    }

    #[test]
    fn parses_thoughts_and_usage() {
        let mut req = CanonicalRequest::chat("gemini-2.5-pro", vec![]);
        req.reasoning_format = ReasoningFormat::Thinking;
        let v = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "answer"}
                ]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {
                "promptTokenCount": 100,
                "candidatesTokenCount": 10,
                "thoughtsTokenCount": 5,
                "cachedContentTokenCount": 40
            }
        });
        let resp = parse_generate_response(&v, &req).unwrap();
        let ResponseOutput::Chat(choices) = &resp.output else {
            panic!("expected chat output")
        };
        assert_eq!(choices[0].message.thinking.as_deref(), Some("pondering"));
        assert_eq!(choices[0].message.text(), "answer");
        assert_eq!(choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(
            resp.usage,
            Some(Usage {
                prompt_tokens: 100,
                completion_tokens: 15,
                cached_prompt_tokens: 40,
            })
        );
    }

    #[test]
    fn stream_reports_last_usage_at_end() {
        let mut p = GeminiStreamParser::default();
        let first = p
            .on_frame(&frame(json!({
                "candidates": [{"content": {"parts": [{"text": "Hel"}]}}],
                "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 1}
            })))
            .unwrap();
        assert_eq!(first[0].delta.role, Some(Role::Assistant));
        assert_eq!(first[1].delta.content.as_deref(), Some("Hel"));

        let second = p
            .on_frame(&frame(json!({
                "candidates": [{"content": {"parts": [{"text": "lo"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2}
            })))
            .unwrap();
        assert_eq!(second.last().unwrap().finish_reason.as_deref(), Some("stop"));
        assert_eq!(p.finish(), vec![StreamChunk::usage_only(Usage::new(7, 2))]);
    }

    #[test]
    fn only_gemini_models() {
        let adaptor = GeminiAdaptor::new("v1").unwrap();
        assert!(adaptor.supports_model("gemini-2.5-pro"));
        assert!(adaptor.supports_model("gemma-3-27b-it"));
        assert!(!adaptor.supports_model("gpt-4o"));
    }
}
