//! OpenAI and generic OpenAI-compatible (custom) channels.

use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::{json, Value};

use super::openai_compat::{self, OpenAiStreamParser};
use super::{Adaptor, StreamParser, UpstreamBody, UpstreamTarget};
use crate::channel::ChannelType;
use crate::error::RelayError;
use crate::relay::{
    format_seconds, CanonicalRequest, CanonicalResponse, RelayMode, ResponseOutput, Usage,
    VideoJob, VideoStatus,
};

/// Seconds requested when a video call names no duration.
const DEFAULT_VIDEO_SECONDS: f64 = 4.0;

pub struct OpenAiAdaptor {
    channel_type: ChannelType,
}

impl OpenAiAdaptor {
    /// `channel_type` is `OpenAI` or `Custom`; they share the wire format.
    pub fn new(channel_type: ChannelType) -> Self {
        Self { channel_type }
    }
}

impl Adaptor for OpenAiAdaptor {
    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn supports_mode(&self, mode: RelayMode) -> bool {
        match mode {
            RelayMode::Rerank => self.channel_type == ChannelType::Custom,
            _ => true,
        }
    }

    fn request_url(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<String, RelayError> {
        let base = target.base_url()?;
        Ok(match request.mode {
            RelayMode::ChatCompletions => format!("{}/chat/completions", base),
            RelayMode::Completions => format!("{}/completions", base),
            RelayMode::Rerank => format!("{}/rerank", base),
            RelayMode::AudioSpeech => format!("{}/audio/speech", base),
            RelayMode::VideoGeneration => format!("{}/videos", base),
            RelayMode::VideoFetch => {
                let task_id = request
                    .task_id
                    .as_deref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing task id".into()))?;
                format!("{}/videos/{}", base, urlencoding::encode(task_id))
            }
        })
    }

    fn build_request(
        &self,
        target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
    ) -> Result<UpstreamBody, RelayError> {
        let body = match request.mode {
            RelayMode::ChatCompletions => {
                Value::Object(openai_compat::chat_body(request, target.model))
            }
            RelayMode::Completions => {
                Value::Object(openai_compat::completion_body(request, target.model))
            }
            RelayMode::Rerank => {
                let rerank = request
                    .rerank
                    .as_ref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing rerank body".into()))?;
                openai_compat::rerank_body(rerank, target.model)
            }
            RelayMode::AudioSpeech => {
                let speech = request
                    .speech
                    .as_ref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing speech body".into()))?;
                let mut body = json!({
                    "model": target.model,
                    "input": speech.input,
                    "voice": speech.voice,
                });
                if let Some(format) = &speech.response_format {
                    body["response_format"] = json!(format);
                }
                if let Some(speed) = speech.speed {
                    body["speed"] = json!(speed);
                }
                body
            }
            RelayMode::VideoGeneration => {
                let video = request
                    .video
                    .as_ref()
                    .ok_or_else(|| RelayError::InvalidRequest("missing video body".into()))?;
                let mut body = json!({
                    "model": target.model,
                    "prompt": video.prompt,
                    "seconds": format_seconds(billed_seconds(request)),
                });
                let size = video.resolve_resolution();
                if !size.is_empty() {
                    body["size"] = json!(size);
                }
                if let Some(image) = &video.image_url {
                    body["input_reference"] = json!(image);
                }
                body
            }
            RelayMode::VideoFetch => return Ok(UpstreamBody::Empty),
        };
        Ok(UpstreamBody::Json(body))
    }

    fn parse_response(
        &self,
        _target: &UpstreamTarget<'_>,
        request: &CanonicalRequest,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<CanonicalResponse, RelayError> {
        match request.mode {
            RelayMode::ChatCompletions => openai_compat::parse_chat_response(&body, request),
            RelayMode::Completions => openai_compat::parse_completion_response(&body, request),
            RelayMode::Rerank => openai_compat::parse_rerank_response(&body, request),
            RelayMode::AudioSpeech => {
                let content_type = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .or_else(|| {
                        request
                            .speech
                            .as_ref()
                            .map(|s| s.content_type().to_string())
                    })
                    .unwrap_or_else(|| "audio/mpeg".to_string());
                let chars = request
                    .speech
                    .as_ref()
                    .map(|s| s.input.chars().count() as u64)
                    .unwrap_or(0);
                let mut response = CanonicalResponse::new(
                    request.model.clone(),
                    ResponseOutput::Speech {
                        content_type,
                        audio: body,
                    },
                );
                response.usage = Some(Usage::new(chars, 0));
                Ok(response)
            }
            RelayMode::VideoGeneration => {
                let job = parse_video_job(&openai_compat::parse_json(&body)?, &request.model)?;
                let mut response = CanonicalResponse::new(
                    request.model.clone(),
                    ResponseOutput::Video(job.clone()),
                );
                response.id = job.task_id.clone();
                response.task_id = Some(job.task_id);
                // Sora bills per requested second.
                response.usage = Some(Usage::new(billed_seconds(request) as u64, 0));
                Ok(response)
            }
            RelayMode::VideoFetch => {
                let job = parse_video_job(&openai_compat::parse_json(&body)?, &request.model)?;
                let mut response = CanonicalResponse::new(
                    request.model.clone(),
                    ResponseOutput::Video(job.clone()),
                );
                response.id = job.task_id;
                response.usage = Some(Usage::default());
                Ok(response)
            }
        }
    }

    fn stream_parser(&self, request: &CanonicalRequest) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser::new(request.mode))
    }
}

/// Whole seconds requested for a video, rounded up.
fn billed_seconds(request: &CanonicalRequest) -> f64 {
    request
        .video
        .as_ref()
        .and_then(|v| v.resolve_duration())
        .unwrap_or(DEFAULT_VIDEO_SECONDS)
        .ceil()
}

/// OpenAI `video` object.
fn parse_video_job(v: &Value, model: &str) -> Result<VideoJob, RelayError> {
    let id = v
        .get("id")
        .and_then(|i| i.as_str())
        .ok_or_else(|| RelayError::Parse("video response has no id".into()))?;
    let mut job = VideoJob::queued(id, model);
    job.status = v
        .get("status")
        .cloned()
        .and_then(|s| serde_json::from_value::<VideoStatus>(s).ok())
        .unwrap_or(VideoStatus::Queued);
    job.progress = v.get("progress").and_then(|p| p.as_u64()).map(|p| p as u32);
    job.seconds = v.get("seconds").and_then(|s| {
        s.as_f64()
            .or_else(|| s.as_str().and_then(|s| s.parse().ok()))
    });
    job.size = v.get("size").and_then(|s| s.as_str()).map(str::to_string);
    job.video_url = v
        .get("video_url")
        .or_else(|| v.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);
    job.error = v
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(str::to_string);
    if let Some(created) = v.get("created_at").and_then(|c| c.as_i64()) {
        job.created_at = created;
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::relay::{RerankRequest, VideoRequest};

    fn channel(t: ChannelType) -> Channel {
        let mut c = Channel::new(1, t, "sk-test");
        c.base_url = Some("http://upstream.local/v1".into());
        c
    }

    #[test]
    fn urls_follow_mode() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let ch = channel(ChannelType::OpenAI);
        let target = UpstreamTarget {
            channel: &ch,
            model: "sora-2",
        };
        let fetch = CanonicalRequest::video_fetch("sora-2", "video/abc");
        assert_eq!(
            adaptor.request_url(&target, &fetch).unwrap(),
            "http://upstream.local/v1/videos/video%2Fabc"
        );
        assert_eq!(adaptor.method(&fetch), reqwest::Method::GET);
        assert_eq!(adaptor.build_request(&target, &fetch).unwrap(), UpstreamBody::Empty);
    }

    #[test]
    fn rerank_only_on_custom_channels() {
        assert!(!OpenAiAdaptor::new(ChannelType::OpenAI).supports_mode(RelayMode::Rerank));
        assert!(OpenAiAdaptor::new(ChannelType::Custom).supports_mode(RelayMode::Rerank));

        let adaptor = OpenAiAdaptor::new(ChannelType::Custom);
        let ch = channel(ChannelType::Custom);
        let target = UpstreamTarget {
            channel: &ch,
            model: "bge-reranker",
        };
        let req = CanonicalRequest::rerank(RerankRequest {
            model: "bge-reranker".into(),
            query: "q".into(),
            documents: vec!["a".into(), "b".into()],
            top_n: Some(1),
            return_documents: false,
        });
        let resp = adaptor
            .parse_response(
                &target,
                &req,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"results":[{"index":1,"relevance_score":0.9}],"usage":{"total_tokens":7}}"#),
            )
            .unwrap();
        assert_eq!(resp.usage, Some(Usage::new(7, 0)));
    }

    #[test]
    fn video_create_bills_requested_seconds() {
        let adaptor = OpenAiAdaptor::new(ChannelType::OpenAI);
        let ch = channel(ChannelType::OpenAI);
        let target = UpstreamTarget {
            channel: &ch,
            model: "sora-2",
        };
        let req = CanonicalRequest::video(
            "sora-2",
            VideoRequest {
                prompt: "a cat".into(),
                duration_seconds: Some(8.0),
                resolution: Some("1280x720".into()),
                ..VideoRequest::default()
            },
        );
        let UpstreamBody::Json(body) = adaptor.build_request(&target, &req).unwrap() else {
            panic!("expected json body")
        };
        assert_eq!(body["seconds"], "8");
        assert_eq!(body["size"], "1280x720");

        let resp = adaptor
            .parse_response(
                &target,
                &req,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"id":"video_1","object":"video","status":"queued"}"#),
            )
            .unwrap();
        assert_eq!(resp.task_id.as_deref(), Some("video_1"));
        assert_eq!(resp.usage, Some(Usage::new(8, 0)));
    }

    #[test]
    fn video_fetch_maps_status() {
        let job = parse_video_job(
            &json!({"id": "video_1", "status": "completed", "progress": 100, "seconds": "8"}),
            "sora-2",
        )
        .unwrap();
        assert_eq!(job.status, VideoStatus::Completed);
        assert_eq!(job.seconds, Some(8.0));
        assert_eq!(job.progress, Some(100));
    }
}
