//! OpenAI-compatible wire format shared by several providers.

use serde_json::{json, Map, Value};

use super::sse::SseFrame;
use super::{frame_json, StreamParser};
use crate::error::RelayError;
use crate::relay::{
    CanonicalRequest, CanonicalResponse, ChatChoice, ChatMessage, ChunkDelta, FunctionCallDelta,
    RelayMode, RerankRequest, RerankResult, ResponseOutput, Role, StreamChunk, TextChoice,
    ToolCall, ToolCallDelta, Usage,
};

/// History messages without the gateway-side reasoning fields, which strict
/// upstreams reject.
pub(crate) fn upstream_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let mut m = m.clone();
            m.reasoning = None;
            m.thinking = None;
            m.reasoning_content = None;
            serde_json::to_value(m).unwrap_or(Value::Null)
        })
        .collect()
}

fn insert_common_params(body: &mut Map<String, Value>, request: &CanonicalRequest) {
    let p = &request.params;
    if let Some(t) = p.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(t) = p.top_p {
        body.insert("top_p".into(), json!(t));
    }
    if let Some(m) = p.max_tokens {
        body.insert("max_tokens".into(), json!(m));
    }
    if !p.stop.is_empty() {
        body.insert("stop".into(), json!(p.stop));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
        body.insert("stream_options".into(), json!({ "include_usage": true }));
    }
}

pub(crate) fn chat_body(request: &CanonicalRequest, model: &str) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), json!(upstream_messages(&request.messages)));
    insert_common_params(&mut body, request);
    if !request.params.tools.is_empty() {
        body.insert("tools".into(), json!(request.params.tools));
    }
    if let Some(choice) = &request.params.tool_choice {
        body.insert("tool_choice".into(), choice.clone());
    }
    body
}

pub(crate) fn completion_body(request: &CanonicalRequest, model: &str) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert(
        "prompt".into(),
        json!(request.prompt.clone().unwrap_or_default()),
    );
    insert_common_params(&mut body, request);
    body
}

pub(crate) fn rerank_body(rerank: &RerankRequest, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "query": rerank.query,
        "documents": rerank.documents,
        "return_documents": rerank.return_documents,
    });
    if let Some(n) = rerank.top_n {
        body["top_n"] = json!(n);
    }
    body
}

pub(crate) fn parse_json(body: &[u8]) -> Result<Value, RelayError> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::Parse(format!("invalid upstream JSON: {}", e)))
}

/// Reasoning text under any of the field names providers use.
pub(crate) fn reasoning_of(v: &Value) -> Option<&str> {
    ["reasoning_content", "reasoning", "thinking"]
        .iter()
        .find_map(|k| v.get(*k).and_then(|r| r.as_str()))
        .filter(|s| !s.is_empty())
}

/// Usage from `usage`, or Groq's `x_groq.usage`.
pub(crate) fn usage_of(v: &Value) -> Option<Usage> {
    v.get("usage")
        .filter(|u| !u.is_null())
        .or_else(|| v.get("x_groq").and_then(|x| x.get("usage")))
        .and_then(Usage::from_openai_json)
}

fn response_shell(v: &Value, request: &CanonicalRequest, output: ResponseOutput) -> CanonicalResponse {
    let mut response = CanonicalResponse::new(request.model.clone(), output);
    if let Some(id) = v.get("id").and_then(|i| i.as_str()) {
        response.id = id.to_string();
    }
    if let Some(created) = v.get("created").and_then(|c| c.as_i64()) {
        response.created = created;
    }
    response.usage = usage_of(v);
    response
}

pub(crate) fn parse_chat_response(
    body: &[u8],
    request: &CanonicalRequest,
) -> Result<CanonicalResponse, RelayError> {
    let v = parse_json(body)?;
    let choices = v
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| RelayError::Parse("response has no choices".into()))?;

    let mut out = Vec::with_capacity(choices.len());
    for (i, choice) in choices.iter().enumerate() {
        let msg = choice.get("message").cloned().unwrap_or(Value::Null);
        let mut message = ChatMessage::assistant_empty();
        if let Some(text) = msg.get("content").and_then(|c| c.as_str()) {
            message.content = Some(crate::relay::MessageContent::text(text));
        }
        if let Some(calls) = msg.get("tool_calls").filter(|c| !c.is_null()) {
            let calls: Vec<ToolCall> = serde_json::from_value(calls.clone())
                .map_err(|e| RelayError::Parse(format!("invalid tool_calls: {}", e)))?;
            if !calls.is_empty() {
                message.tool_calls = Some(calls);
            }
        }
        if let Some(reasoning) = reasoning_of(&msg) {
            message.set_reasoning(request.reasoning_format, reasoning);
        }
        out.push(ChatChoice {
            index: choice
                .get("index")
                .and_then(|x| x.as_u64())
                .unwrap_or(i as u64) as u32,
            message,
            finish_reason: choice
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .map(str::to_string),
        });
    }
    Ok(response_shell(&v, request, ResponseOutput::Chat(out)))
}

pub(crate) fn parse_completion_response(
    body: &[u8],
    request: &CanonicalRequest,
) -> Result<CanonicalResponse, RelayError> {
    let v = parse_json(body)?;
    let choices = v
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| RelayError::Parse("response has no choices".into()))?;
    let out = choices
        .iter()
        .enumerate()
        .map(|(i, c)| TextChoice {
            index: c.get("index").and_then(|x| x.as_u64()).unwrap_or(i as u64) as u32,
            text: c
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            finish_reason: c
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .map(str::to_string),
        })
        .collect();
    Ok(response_shell(&v, request, ResponseOutput::Text(out)))
}

pub(crate) fn parse_rerank_response(
    body: &[u8],
    request: &CanonicalRequest,
) -> Result<CanonicalResponse, RelayError> {
    let v = parse_json(body)?;
    let results = v
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| RelayError::Parse("rerank response has no results".into()))?;
    let out = results
        .iter()
        .enumerate()
        .map(|(i, r)| RerankResult {
            index: r.get("index").and_then(|x| x.as_u64()).unwrap_or(i as u64) as u32,
            relevance_score: r
                .get("relevance_score")
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0),
            document: r.get("document").and_then(|d| {
                d.as_str()
                    .or_else(|| d.get("text").and_then(|t| t.as_str()))
                    .map(str::to_string)
            }),
        })
        .collect();
    let mut response = response_shell(&v, request, ResponseOutput::Rerank(out));
    // Rerank APIs often only report total tokens.
    if response.usage.is_none() {
        response.usage = v
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64())
            .map(|t| Usage::new(t, 0));
    }
    Ok(response)
}

/// Decoder for OpenAI-style `chat.completion.chunk` / `text_completion`
/// streams.
pub(crate) struct OpenAiStreamParser {
    mode: RelayMode,
}

impl OpenAiStreamParser {
    pub(crate) fn new(mode: RelayMode) -> Self {
        Self { mode }
    }
}

impl StreamParser for OpenAiStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamChunk>, RelayError> {
        let Some(v) = frame_json(frame)? else {
            return Ok(Vec::new());
        };
        let mut chunks = Vec::new();
        for choice in v
            .get("choices")
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let mut chunk = StreamChunk {
                index: choice.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
                finish_reason: choice
                    .get("finish_reason")
                    .and_then(|f| f.as_str())
                    .map(str::to_string),
                ..StreamChunk::default()
            };
            if self.mode == RelayMode::Completions {
                chunk.delta.content = choice
                    .get("text")
                    .and_then(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string);
            } else if let Some(delta) = choice.get("delta") {
                chunk.delta = parse_delta(delta)?;
            }
            if chunk.delta != ChunkDelta::default() || chunk.finish_reason.is_some() {
                chunks.push(chunk);
            }
        }
        if let Some(usage) = usage_of(&v) {
            match chunks.last_mut() {
                Some(last) => last.usage = Some(usage),
                None => chunks.push(StreamChunk::usage_only(usage)),
            }
        }
        Ok(chunks)
    }
}

fn parse_delta(delta: &Value) -> Result<ChunkDelta, RelayError> {
    let role = match delta.get("role").and_then(|r| r.as_str()) {
        Some("assistant") => Some(Role::Assistant),
        _ => None,
    };
    let mut tool_calls = Vec::new();
    if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
        for (i, call) in calls.iter().enumerate() {
            let function = call.get("function");
            tool_calls.push(ToolCallDelta {
                index: call.get("index").and_then(|x| x.as_u64()).unwrap_or(i as u64) as u32,
                id: call.get("id").and_then(|x| x.as_str()).map(str::to_string),
                call_type: call.get("type").and_then(|x| x.as_str()).map(str::to_string),
                function: FunctionCallDelta {
                    name: function
                        .and_then(|f| f.get("name"))
                        .and_then(|x| x.as_str())
                        .map(str::to_string),
                    arguments: function
                        .and_then(|f| f.get("arguments"))
                        .and_then(|x| x.as_str())
                        .map(str::to_string),
                },
            });
        }
    }
    Ok(ChunkDelta {
        role,
        content: delta
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string),
        reasoning: reasoning_of(delta).map(str::to_string),
        tool_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ReasoningFormat;

    fn frame(data: &str) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
            extra: vec![],
        }
    }

    #[test]
    fn chat_response_reasoning_follows_format() {
        let mut req = CanonicalRequest::chat("deepseek-r1", vec![]);
        req.reasoning_format = ReasoningFormat::Thinking;
        let body = br#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"42","reasoning_content":"think"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#;
        let resp = parse_chat_response(body, &req).unwrap();
        let ResponseOutput::Chat(choices) = resp.output else {
            panic!("expected chat output")
        };
        let m = &choices[0].message;
        assert_eq!(m.thinking.as_deref(), Some("think"));
        assert!(m.reasoning_content.is_none());
        assert_eq!(resp.usage, Some(Usage::new(3, 2)));
        assert_eq!(resp.model, "deepseek-r1");
    }

    #[test]
    fn stream_parser_reads_deltas_and_usage() {
        let mut p = OpenAiStreamParser::new(RelayMode::ChatCompletions);
        let chunks = p
            .on_frame(&frame(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"}}]}"#))
            .unwrap();
        assert_eq!(chunks[0].delta.content.as_deref(), Some("Hi"));
        assert_eq!(chunks[0].delta.role, Some(Role::Assistant));

        let chunks = p
            .on_frame(&frame(r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#))
            .unwrap();
        assert_eq!(chunks, vec![StreamChunk::usage_only(Usage::new(5, 1))]);
    }

    #[test]
    fn stream_parser_surfaces_error_frames() {
        let mut p = OpenAiStreamParser::new(RelayMode::ChatCompletions);
        let err = p
            .on_frame(&frame(r#"{"error":{"message":"rate limited","type":"rate_limit_error"}}"#))
            .unwrap_err();
        assert!(err.is_failover_eligible());
    }

    #[test]
    fn upstream_messages_drop_reasoning() {
        let mut m = ChatMessage::new(Role::Assistant, "ok");
        m.reasoning_content = Some("secret".into());
        let v = upstream_messages(&[m]);
        assert!(v[0].get("reasoning_content").is_none());
        assert_eq!(v[0]["content"], "ok");
    }
}
