//! Novita AI: OpenAI-compatible chat and completions.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::openai_compat::{self, OpenAiStreamParser};
use super::{Adaptor, StreamParser, UpstreamBody, UpstreamTarget};
use crate::channel::ChannelType;
use crate::error::RelayError;
use crate::relay::{CanonicalRequest, CanonicalResponse, RelayMode};

pub struct NovitaAdaptor;

impl NovitaAdaptor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NovitaAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Adaptor for NovitaAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Novita
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        matches!(mode, RelayMode::ChatCompletions | RelayMode::Completions)
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        let base = target.base_url()?;
        Ok(match request.mode {
            RelayMode::Completions => format!("{}/completions", base),
            _ => format!("{}/chat/completions", base),
        })
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request.mode {
            RelayMode::Completions => openai_compat::completion_body(request, target.model),
            _ => openai_compat::chat_body(request, target.model),
        };
        Ok(UpstreamBody::Json(Value::Object(body)))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        match request.mode {
            RelayMode::Completions => openai_compat::parse_completion_response(&body, request),
            _ => openai_compat::parse_chat_response(&body, request),
        }
    }

    fn stream_parser(&self, request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser::new(request.mode))
    }
}
