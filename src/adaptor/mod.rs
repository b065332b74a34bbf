//! Protocol adaptors: one variant per upstream provider.
//!
//! An adaptor turns a [`CanonicalRequest`] into the provider's HTTP call and
//! the provider's reply (unary body or SSE stream) back into canonical form.
//! The dispatcher only ever talks to `dyn Adaptor`.

mod anthropic;
mod gemini;
mod groq;
mod novita;
mod openai;
mod openai_compat;
pub mod sse;
mod zhipu;

pub use anthropic::AnthropicAdaptor;
pub use gemini::GeminiAdaptor;
pub use groq::GroqAdaptor;
pub use novita::NovitaAdaptor;
pub use openai::OpenAiAdaptor;
pub use zhipu::ZhipuAdaptor;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::Value;

use crate::channel::{Channel, ChannelType};
use crate::error::{classify_embedded_error, classify_http_status, RelayError, UnavailableReason};
use crate::relay::{CanonicalRequest, CanonicalResponse, RelayMode, StreamChunk};
use sse::SseFrame;

/// Lazily produced, finite, non-restartable stream of parsed chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, RelayError>> + Send>>;

/// What an upstream call produced.
pub enum UpstreamReply {
    Unary(CanonicalResponse),
    Stream(ChunkStream),
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(r) => f.debug_tuple("Unary").field(r).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The channel a request is being sent to, with the model name already
/// mapped for that channel.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamTarget<'a> {
    pub channel: &'a Channel,
    pub model: &'a str,
}

impl UpstreamTarget<'_> {
    pub fn base_url(&self) -> Result<String, RelayError> {
        self.channel.effective_base_url().ok_or_else(|| {
            RelayError::Configuration(format!("channel {} has no base_url", self.channel.id))
        })
    }
}

/// Request body to send upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamBody {
    Json(Value),
    Empty,
}

/// Incremental decoder from SSE frames to canonical chunks.
pub trait StreamParser: Send {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamChunk>, RelayError>;

    /// Called once after the upstream stream ends.
    fn finish(&mut self) -> Vec<StreamChunk> {
        Vec::new()
    }
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    fn supports_mode(&self, mode: RelayMode) -> bool;

    /// Whether the provider can serve this (already mapped) model.
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError>;

    fn method(&self, request: &CanonicalRequest) -> reqwest::Method {
        if request.mode == RelayMode::VideoFetch {
            reqwest::Method::GET
        } else {
            reqwest::Method::POST
        }
    }

    /// Bearer token by default.
    fn auth_headers(&self, channel: &Channel) -> Result<HeaderMap, RelayError> {
        bearer_headers(&channel.api_key)
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError>;

    fn parse_response(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError>;

    fn stream_parser(&self, request: &CanonicalRequest) -> Box<dyn StreamParser>;

    fn classify_error(&self, status: u16, headers: &HeaderMap, body: &[u8]) -> RelayError {
        classify_http_status(status, body, retry_after_from_headers(headers))
    }

    /// Send the request and return a unary reply or a peeked stream.
    async fn invoke(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamReply, RelayError> {
        invoke_http(self, client, target, request).await
    }
}

/// Default HTTP exchange shared by every adaptor.
pub async fn invoke_http<A: Adaptor + ?Sized>(
    adaptor: &A,
    client: &reqwest::Client,
    target: &UpstreamTarget<'_>,
    request: &CanonicalRequest,
) -> Result<UpstreamReply, RelayError> {
    let url = adaptor.request_url(target, request)?;
    let mut builder = client
        .request(adaptor.method(request), &url)
        .headers(adaptor.auth_headers(target.channel)?);
    if let UpstreamBody::Json(body) = adaptor.build_request(target, request)? {
        builder = builder.json(&body);
    }
    let streaming = request.stream && streamable(request.mode);
    if streaming {
        builder = builder.header(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    tracing::debug!(
        channel_id = target.channel.id,
        channel_type = %adaptor.channel_type(),
        upstream_model = target.model,
        mode = %request.mode,
        url = %url,
        "Calling upstream"
    );

    let response = builder
        .send()
        .await
        .map_err(|e| RelayError::from_transport(&e))?;
    let status = response.status();
    let headers = response.headers().clone();

    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return Err(adaptor.classify_error(status.as_u16(), &headers, &body));
    }

    let is_event_stream = headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    if streaming && is_event_stream {
        let chunks = parse_frames(
            sse::frames(response.bytes_stream()),
            adaptor.stream_parser(request),
        );
        return peek_first(chunks).await.map(UpstreamReply::Stream);
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| RelayError::from_transport(&e))?;
    if let Some(err) = embedded_error(&body) {
        return Err(err);
    }
    adaptor
        .parse_response(target, request, &headers, body)
        .map(UpstreamReply::Unary)
}

fn streamable(mode: RelayMode) -> bool {
    matches!(mode, RelayMode::ChatCompletions | RelayMode::Completions)
}

/// An error object in a 2xx JSON body. Objects that carry their own `id`
/// (video jobs) report job failures in `error` and are not errors here.
fn embedded_error(body: &[u8]) -> Option<RelayError> {
    let v: Value = serde_json::from_slice(body).ok()?;
    let err = v.get("error")?;
    if err.is_null() || v.get("id").is_some() {
        return None;
    }
    Some(classify_embedded_error(&v))
}

/// Parse an SSE `data:` payload as JSON, surfacing embedded errors.
pub(crate) fn frame_json(frame: &SseFrame) -> Result<Option<Value>, RelayError> {
    if frame.data.trim().is_empty() {
        return Ok(None);
    }
    let v: Value = serde_json::from_str(&frame.data)
        .map_err(|e| RelayError::Parse(format!("invalid stream frame: {}", e)))?;
    if frame.event.as_deref() == Some("error") || v.get("error").is_some_and(|e| !e.is_null()) {
        return Err(classify_embedded_error(&v));
    }
    Ok(Some(v))
}

/// Drive a parser over decoded frames. Ends at `[DONE]` or upstream EOF.
pub fn parse_frames<S>(frames: S, mut parser: Box<dyn StreamParser>) -> ChunkStream
where
    S: Stream<Item = Result<SseFrame, RelayError>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut frames = Box::pin(frames);
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if frame.is_done() {
                break;
            }
            match parser.on_frame(&frame) {
                Ok(chunks) => {
                    for chunk in chunks {
                        yield Ok(chunk);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for chunk in parser.finish() {
            yield Ok(chunk);
        }
    })
}

/// Wait for the first chunk so that failures before any output (error
/// frame, empty stream) surface as errors the dispatcher can fail over on.
pub async fn peek_first(mut stream: ChunkStream) -> Result<ChunkStream, RelayError> {
    match stream.next().await {
        Some(Ok(first)) => Ok(Box::pin(
            futures::stream::once(async move { Ok(first) }).chain(stream),
        )),
        Some(Err(e)) => Err(e),
        None => Err(RelayError::unavailable(
            UnavailableReason::ServerError,
            "upstream closed the stream without sending any data",
        )),
    }
}

pub(crate) fn bearer_headers(api_key: &str) -> Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        header_value(&format!("Bearer {}", api_key))?,
    );
    Ok(headers)
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::Configuration("channel credential is not a valid header value".into()))
}

/// Maximum cooldown taken from a provider header (1 hour).
const MAX_HEADER_COOLDOWN_SECS: f64 = 3600.0;

/// `Retry-After` as numeric seconds.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    if secs > 0.0 {
        Some(Duration::from_secs_f64(secs.min(MAX_HEADER_COOLDOWN_SECS)))
    } else {
        None
    }
}

/// Channel type → adaptor.
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("channel_types", &self.adaptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Settings adaptors read at construction.
#[derive(Debug, Clone)]
pub struct AdaptorSettings {
    /// Gemini API version for models that do not need v1beta.
    pub gemini_api_version: String,
}

impl Default for AdaptorSettings {
    fn default() -> Self {
        Self {
            gemini_api_version: "v1".to_string(),
        }
    }
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in provider.
    pub fn with_defaults(settings: &AdaptorSettings) -> Result<Self, RelayError> {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiAdaptor::new(ChannelType::OpenAI)));
        registry.register(Arc::new(OpenAiAdaptor::new(ChannelType::Custom)));
        registry.register(Arc::new(AnthropicAdaptor::new()));
        registry.register(Arc::new(GeminiAdaptor::new(&settings.gemini_api_version)?));
        registry.register(Arc::new(GroqAdaptor::new()));
        registry.register(Arc::new(ZhipuAdaptor::new()));
        registry.register(Arc::new(NovitaAdaptor::new()));
        Ok(registry)
    }

    pub fn register(&mut self, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(adaptor.channel_type(), adaptor);
    }

    pub fn get(&self, channel_type: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&channel_type).cloned()
    }
}
