//! Zhipu AI (BigModel): v4 OpenAI-style surface for GLM, CogVideoX and
//! rerank, plus the legacy v3 `model-api` surface for `chatglm_*` models.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use serde_json::{json, Value};
use sha2::Sha256;

use super::openai_compat::{self, parse_json, OpenAiStreamParser};
use super::sse::SseFrame;
use super::{
    header_value, invoke_http, retry_after_from_headers, Adaptor, StreamParser, UpstreamBody,
    UpstreamReply, UpstreamTarget,
};
use crate::channel::{Channel, ChannelType};
use crate::error::{
    classify_http_status, upstream_error_message, RelayError, UnavailableReason,
};
use crate::relay::{
    CanonicalRequest, CanonicalResponse, ChatChoice, ChatMessage, MessageContent, RelayMode,
    ResponseOutput, Role, StreamChunk, Usage, VideoJob, VideoStatus,
};

/// Lifetime of a signed legacy API token.
const LEGACY_TOKEN_TTL_MS: i64 = 3_600_000;

fn is_legacy_model(model: &str) -> bool {
    model.starts_with("chatglm_")
}

pub struct ZhipuAdaptor {
    legacy: LegacyZhipu,
}

impl ZhipuAdaptor {
    pub fn new() -> Self {
        Self {
            legacy: LegacyZhipu,
        }
    }
}

impl Default for ZhipuAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adaptor for ZhipuAdaptor {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Zhipu
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        matches!(
            mode,
            RelayMode::ChatCompletions
                | RelayMode::Rerank
                | RelayMode::VideoGeneration
                | RelayMode::VideoFetch
        )
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("glm-")
            || model.starts_with("cogvideox")
            || model.starts_with("rerank")
            || is_legacy_model(model)
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        let base = target.base_url()?;
        Ok(match request.mode {
            RelayMode::Rerank => format!("{}/api/paas/v4/rerank", base),
            RelayMode::VideoGeneration => format!("{}/api/paas/v4/videos/generations", base),
            RelayMode::VideoFetch => {
                let task_id = request
                    .task_id
                    .as_deref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing task id".into()))?;
                format!(
                    "{}/api/paas/v4/async-result/{}",
                    base,
                    urlencoding::encode(task_id)
                )
            }
            _ => format!("{}/api/paas/v4/chat/completions", base),
        })
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request.mode {
            RelayMode::Rerank => {
                let rerank = request
                    .rerank
                    .as_ref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing rerank body".into()))?;
                openai_compat::rerank_body(rerank, target.model)
            }
            RelayMode::VideoGeneration => {
                let video = request
                    .video
                    .as_ref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing video body".into()))?;
                let mut body = json!({ "model": target.model, "prompt": video.prompt });
                if let Some(d) = video.resolve_duration() {
                    body["duration"] = json!(d.ceil() as u64);
                }
                let size = video.resolve_resolution();
                if !size.is_empty() {
                    body["size"] = json!(size);
                }
                if let Some(image) = &video.image_url {
                    body["image_url"] = json!(image);
                }
                body
            }
            RelayMode::VideoFetch => return Ok(UpstreamBody::Empty),
            _ => Value::Object(openai_compat::chat_body(request, target.model)),
        };
        Ok(UpstreamBody::Json(body))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        match request.mode {
            RelayMode::Rerank => openai_compat::parse_rerank_response(&body, request),
            RelayMode::VideoGeneration => {
                let v = parse_json(&body)?;
                let task_id = v
                    .get("id")
                    .and_then(|i| i.as_str())
                    .ok_or_else(|| RelayError::Parse("video response has no id".into()))?;
                let job = video_job(&v, task_id, &request.model);
                let mut response = CanonicalResponse::new(
                    request.model.clone(),
                    ResponseOutput::Video(job),
                );
                response.id = task_id.to_string();
                response.task_id = Some(task_id.to_string());
                // CogVideoX bills per generated video.
                response.usage = Some(Usage::new(1, 0));
                Ok(response)
            }
            RelayMode::VideoFetch => {
                let v = parse_json(&body)?;
                let task_id = request.task_id.as_deref().unwrap_or_default();
                let job = video_job(&v, task_id, &request.model);
                let mut response = CanonicalResponse::new(
                    request.model.clone(),
                    ResponseOutput::Video(job),
                );
                response.id = task_id.to_string();
                response.usage = Some(Usage::default());
                Ok(response)
            }
            _ => openai_compat::parse_chat_response(&body, request),
        }
    }

    fn stream_parser(&self, request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser::new(request.mode))
    }

    fn classify_error(&self, status: u16, headers: &HeaderMap, body: &[u8]) -> RelayError {
        classify_zhipu_error(status, headers, body)
    }

    async fn invoke(
        &self,
        client: &reqwest::Client,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamReply, RelayError> {
        if request.mode == RelayMode::ChatCompletions && is_legacy_model(target.model) {
            invoke_http(&self.legacy, client, target, request).await
        } else {
            invoke_http(self, client, target, request).await
        }
    }
}

fn video_job(v: &Value, task_id: &str, model: &str) -> VideoJob {
    let mut job = VideoJob::queued(task_id, model);
    job.status = match v.get("task_status").and_then(|s| s.as_str()) {
        Some("SUCCESS") => VideoStatus::Completed,
        Some("FAIL") => VideoStatus::Failed,
        Some("PROCESSING") => VideoStatus::InProgress,
        _ => VideoStatus::Queued,
    };
    job.video_url = v
        .get("video_result")
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
        .and_then(|r| r.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);
    if job.status == VideoStatus::Failed {
        job.error = Some(
            upstream_error_message(v.to_string().as_bytes())
                .unwrap_or_else(|| "video generation failed".to_string()),
        );
    }
    job
}

/// Zhipu business error codes, shared by the v3 and v4 surfaces.
fn zhipu_code_error(code: i64, status: Option<u16>, message: String, body: &[u8]) -> RelayError {
    let unavailable = |reason| RelayError::UpstreamUnavailable {
        reason,
        status,
        message: message.clone(),
        retry_after: None,
    };
    let rejected = || RelayError::UpstreamRejected {
        status: status.unwrap_or(400),
        message: message.clone(),
        body: Bytes::copy_from_slice(body),
    };
    match code {
        401 | 1000..=1004 => unavailable(UnavailableReason::AuthError),
        1302 | 1303 | 1305 => unavailable(UnavailableReason::RateLimit),
        1113 | 1200..=1299 | 1301 => rejected(),
        _ => unavailable(UnavailableReason::ServerError),
    }
}

fn error_code(v: &Value) -> Option<i64> {
    let code = v.get("error").and_then(|e| e.get("code")).or_else(|| v.get("code"))?;
    code.as_i64()
        .or_else(|| code.as_str().and_then(|s| s.parse().ok()))
}

fn classify_zhipu_error(status: u16, headers: &HeaderMap, body: &[u8]) -> RelayError {
    let code = serde_json::from_slice::<Value>(body)
        .ok()
        .as_ref()
        .and_then(error_code);
    match code {
        Some(code) if code >= 1000 => zhipu_code_error(
            code,
            Some(status),
            upstream_error_message(body).unwrap_or_else(|| format!("HTTP {}", status)),
            body,
        ),
        _ => classify_http_status(status, body, retry_after_from_headers(headers)),
    }
}

/// Signed token for the v3 API from an `id.secret` key.
fn legacy_token(api_key: &str, now_ms: i64) -> Result<String, RelayError> {
    let (id, secret) = api_key.split_once('.').ok_or_else(|| {
        RelayError::Configuration("zhipu legacy api key must look like <id>.<secret>".into())
    })?;
    let header = json!({ "alg": "HS256", "sign_type": "SIGN" });
    let payload = json!({
        "api_key": id,
        "exp": now_ms + LEGACY_TOKEN_TTL_MS,
        "timestamp": now_ms,
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| RelayError::Configuration(format!("invalid zhipu secret: {}", e)))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{}.{}", signing_input, signature))
}

/// `chatglm_*` models on the v3 `model-api` surface.
struct LegacyZhipu;

impl Adaptor for LegacyZhipu {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Zhipu
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        mode == RelayMode::ChatCompletions
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        let method = if request.stream { "sse-invoke" } else { "invoke" };
        Ok(format!(
            "{}/api/paas/v3/model-api/{}/{}",
            target.base_url()?,
            target.model,
            method
        ))
    }

    fn auth_headers(&self, channel: &Channel) -> Result<HeaderMap, RelayError> {
        let token = legacy_token(&channel.api_key, chrono::Utc::now().timestamp_millis())?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&token)?);
        Ok(headers)
    }

    fn build_request(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        // v3 has no system role.
        let prompt: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                json!({ "role": role, "content": m.text() })
            })
            .collect();
        let mut body = json!({ "prompt": prompt });
        if let Some(t) = request.params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.params.top_p {
            body["top_p"] = json!(p);
        }
        if request.stream {
            body["incremental"] = json!(true);
        }
        Ok(UpstreamBody::Json(body))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        _headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        let v = parse_json(&body)?;
        if !v.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
            let message = v
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("zhipu request failed")
                .to_string();
            return Err(zhipu_code_error(
                error_code(&v).unwrap_or(0),
                None,
                message,
                &body,
            ));
        }
        let data = v.get("data").cloned().unwrap_or(Value::Null);
        let choices = data
            .get("choices")
            .and_then(|c| c.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let raw = c.get("content").and_then(|t| t.as_str()).unwrap_or_default();
                let mut message = ChatMessage::assistant_empty();
                message.content = Some(MessageContent::text(unquote(raw)));
                ChatChoice {
                    index: i as u32,
                    message,
                    finish_reason: Some("stop".to_string()),
                }
            })
            .collect();
        let mut response = CanonicalResponse::new(request.model.clone(), ResponseOutput::Chat(choices));
        if let Some(id) = data.get("task_id").and_then(|t| t.as_str()) {
            response.id = id.to_string();
        }
        response.usage = data.get("usage").and_then(Usage::from_openai_json);
        Ok(response)
    }

    fn stream_parser(&self, _request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(LegacyStreamParser)
    }

    fn classify_error(&self, status: u16, headers: &HeaderMap, body: &[u8]) -> RelayError {
        classify_zhipu_error(status, headers, body)
    }
}

/// v3 replies wrap content in JSON string quotes.
fn unquote(raw: &str) -> String {
    serde_json::from_str::<String>(raw)
        .unwrap_or_else(|_| raw.trim_matches('"').to_string())
        .trim()
        .to_string()
}

/// v3 streams raw text in `add` events and usage in the `meta` field of the
/// `finish` event.
struct LegacyStreamParser;

impl StreamParser for LegacyStreamParser {
    fn on_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamChunk>, RelayError> {
        match frame.event.as_deref() {
            Some("add") | None if !frame.data.is_empty() => {
                Ok(vec![StreamChunk::content(frame.data.clone())])
            }
            Some("finish") => {
                let mut chunk = StreamChunk::finish("stop");
                if !frame.data.is_empty() {
                    chunk.delta.content = Some(frame.data.clone());
                }
                chunk.usage = frame
                    .field("meta")
                    .and_then(|m| serde_json::from_str::<Value>(m).ok())
                    .and_then(|m| m.get("usage").and_then(Usage::from_openai_json));
                Ok(vec![chunk])
            }
            Some("error") | Some("interrupted") => Err(RelayError::unavailable(
                UnavailableReason::ServerError,
                if frame.data.is_empty() {
                    "zhipu stream interrupted".to_string()
                } else {
                    frame.data.clone()
                },
            )),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::VideoRequest;

    fn channel() -> Channel {
        Channel::new(5, ChannelType::Zhipu, "abc.s3cret")
    }

    #[test]
    fn legacy_token_is_a_signed_jwt() {
        let token = legacy_token("abc.s3cret", 1_700_000_000_000).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);
        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header, json!({"alg": "HS256", "sign_type": "SIGN"}));
        let payload: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(payload["api_key"], "abc");
        assert_eq!(payload["exp"], 1_700_003_600_000i64);

        let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
        mac.update(format!("{}.{}", parts[0], parts[1]).as_bytes());
        mac.verify_slice(&URL_SAFE_NO_PAD.decode(parts[2]).unwrap())
            .unwrap();

        assert!(legacy_token("no-dot", 0).is_err());
    }

    #[test]
    fn legacy_urls_and_reply() {
        let ch = channel();
        let target = UpstreamTarget {
            channel: &ch,
            model: "chatglm_turbo",
        };
        let mut req = CanonicalRequest::chat(
            "chatglm_turbo",
            vec![
                ChatMessage::new(Role::System, "sys"),
                ChatMessage::new(Role::User, "hi"),
            ],
        );
        req.stream = true;
        assert_eq!(
            LegacyZhipu.request_url(&target, &req).unwrap(),
            "https://open.bigmodel.cn/api/paas/v3/model-api/chatglm_turbo/sse-invoke"
        );
        let UpstreamBody::Json(body) = LegacyZhipu.build_request(&target, &req).unwrap() else {
            panic!("expected json body")
        };
        assert_eq!(body["prompt"][0]["role"], "user");
        assert_eq!(body["incremental"], true);

        req.stream = false;
        let resp = LegacyZhipu
            .parse_response(
                &target,
                &req,
                &HeaderMap::new(),
                Bytes::from_static(
                    br#"{"code":200,"success":true,"data":{"task_id":"t1","choices":[{"role":"assistant","content":"\" hello\""}],"usage":{"prompt_tokens":3,"completion_tokens":2}}}"#,
                ),
            )
            .unwrap();
        let ResponseOutput::Chat(choices) = &resp.output else {
            panic!("expected chat output")
        };
        assert_eq!(choices[0].message.text(), "hello");
        assert_eq!(resp.usage, Some(Usage::new(3, 2)));
    }

    #[test]
    fn legacy_failures_use_business_codes() {
        let ch = channel();
        let target = UpstreamTarget {
            channel: &ch,
            model: "chatglm_pro",
        };
        let req = CanonicalRequest::chat("chatglm_pro", vec![]);
        let err = LegacyZhipu
            .parse_response(
                &target,
                &req,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"code":1302,"msg":"too many requests","success":false}"#),
            )
            .unwrap_err();
        assert_eq!(err.unavailable_reason(), Some(UnavailableReason::RateLimit));

        let err = classify_zhipu_error(429, &HeaderMap::new(), br#"{"error":{"code":"1113","message":"balance"}}"#);
        assert!(!err.is_failover_eligible());
        assert_eq!(err.status_code(), 429);
    }

    #[test]
    fn legacy_stream_events() {
        let mut p = LegacyStreamParser;
        let add = SseFrame {
            event: Some("add".into()),
            data: "Hel".into(),
            extra: vec![],
        };
        assert_eq!(p.on_frame(&add).unwrap()[0].delta.content.as_deref(), Some("Hel"));

        let finish = SseFrame {
            event: Some("finish".into()),
            data: String::new(),
            extra: vec![(
                "meta".into(),
                r#"{"usage":{"prompt_tokens":4,"completion_tokens":6}}"#.into(),
            )],
        };
        let chunks = p.on_frame(&finish).unwrap();
        assert_eq!(chunks[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(chunks[0].usage, Some(Usage::new(4, 6)));

        let err = p
            .on_frame(&SseFrame {
                event: Some("error".into()),
                data: "boom".into(),
                extra: vec![],
            })
            .unwrap_err();
        assert!(err.is_failover_eligible());
    }

    #[test]
    fn cogvideox_jobs() {
        let adaptor = ZhipuAdaptor::new();
        let ch = channel();
        let target = UpstreamTarget {
            channel: &ch,
            model: "cogvideox-3",
        };
        let req = CanonicalRequest::video(
            "cogvideox-3",
            VideoRequest {
                prompt: "waves".into(),
                seconds: Some(5.0),
                ..VideoRequest::default()
            },
        );
        assert_eq!(
            adaptor.request_url(&target, &req).unwrap(),
            "https://open.bigmodel.cn/api/paas/v4/videos/generations"
        );
        let resp = adaptor
            .parse_response(
                &target,
                &req,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"id":"8202","model":"cogvideox-3","task_status":"PROCESSING"}"#),
            )
            .unwrap();
        assert_eq!(resp.task_id.as_deref(), Some("8202"));
        assert_eq!(resp.usage, Some(Usage::new(1, 0)));

        let fetch = CanonicalRequest::video_fetch("cogvideox-3", "8202");
        assert_eq!(
            adaptor.request_url(&target, &fetch).unwrap(),
            "https://open.bigmodel.cn/api/paas/v4/async-result/8202"
        );
        let resp = adaptor
            .parse_response(
                &target,
                &fetch,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"task_status":"SUCCESS","video_result":[{"url":"https://cdn/v.mp4"}]}"#),
            )
            .unwrap();
        let ResponseOutput::Video(job) = resp.output else {
            panic!("expected video output")
        };
        assert_eq!(job.status, VideoStatus::Completed);
        assert_eq!(job.video_url.as_deref(), Some("https://cdn/v.mp4"));
    }

    #[test]
    fn model_support() {
        let adaptor = ZhipuAdaptor::new();
        assert!(adaptor.supports_model("glm-4.6"));
        assert!(adaptor.supports_model("chatglm_turbo"));
        assert!(adaptor.supports_model("cogvideox-3"));
        assert!(!adaptor.supports_model("gpt-4o"));
        assert!(!adaptor.supports_mode(RelayMode::AudioSpeech));
    }
}
