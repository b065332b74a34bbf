//! Groq: OpenAI-compatible chat with parsed reasoning for reasoning models.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::openai_compat::{self, OpenAiStreamParser};
use super::{Adaptor, StreamParser, UpstreamBody, UpstreamTarget};
use crate::channel::ChannelType;
use crate::error::RelayError;
use crate::relay::{CanonicalRequest, CanonicalResponse, RelayMode};

pub struct GroqAdaptor;

impl GroqAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GroqAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Models that emit `<think>` blocks unless asked for a parsed field.
fn emits_reasoning(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("qwen3") || model.contains("deepseek-r1") || model.contains("qwq")
}

impl Adaptor for GroqAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Groq
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        _request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        Ok(format!("{}/chat/completions", target.base_url()?))
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let mut body = openai_compat::chat_body(request, target.model);
        if emits_reasoning(target.model) {
            body.insert("reasoning_format".into(), json!("parsed"));
        }
        Ok(UpstreamBody::Json(Value::Object(body)))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        openai_compat::parse_chat_response(&body, request)
    }

    fn stream_parser(&self, request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser::new(request.mode))
    }
}
