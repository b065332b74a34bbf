//! OpenAI-compatible relay handlers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::adaptor::ChunkStream;
use crate::dispatcher::{DispatchContext, Dispatched, RequestUser};
use crate::error::{DispatchFailure, RelayError};
use crate::relay::{
    CanonicalRequest, ChatCompletionRequest, ChunkEnvelope, CompletionRequest, RerankRequest,
    ResponseOutput, SpeechRequest, VideoRequest,
};
use crate::task_binding::RoutingContext;

use super::routes::AppState;

pub(super) const REQUEST_ID_HEADER: &str = "x-request-id";
const USER_ID_HEADER: &str = "x-relay-user-id";
const TOKEN_ID_HEADER: &str = "x-relay-token-id";

const TEXT_EVENT_STREAM: &str = "text/event-stream";
const NO_CACHE: &str = "no-cache";

pub(super) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    match parse_body::<ChatCompletionRequest>(&body) {
        Ok(req) => relay(&state, &headers, request_id, req.into(), None).await,
        Err(e) => error_response(&request_id, &e),
    }
}

pub(super) async fn completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    match parse_body::<CompletionRequest>(&body) {
        Ok(req) => relay(&state, &headers, request_id, req.into(), None).await,
        Err(e) => error_response(&request_id, &e),
    }
}

pub(super) async fn rerank(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let req = match parse_body::<RerankRequest>(&body) {
        Ok(req) => req,
        Err(e) => return error_response(&request_id, &e),
    };
    if req.documents.is_empty() {
        return error_response(
            &request_id,
            &RelayError::InvalidRequest("documents must not be empty".into()),
        );
    }
    relay(&state, &headers, request_id, CanonicalRequest::rerank(req), None).await
}

pub(super) async fn speech(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    match parse_body::<SpeechRequest>(&body) {
        Ok(req) => relay(&state, &headers, request_id, CanonicalRequest::speech(req), None).await,
        Err(e) => error_response(&request_id, &e),
    }
}

pub(super) async fn create_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let req = match parse_body::<VideoRequest>(&body) {
        Ok(req) => req,
        Err(e) => return error_response(&request_id, &e),
    };
    let model = req
        .model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.default_video_model.clone());
    relay(
        &state,
        &headers,
        request_id,
        CanonicalRequest::video(model, req),
        None,
    )
    .await
}

/// Poll a video job. A routing context from the binding middleware pins the
/// request to the channel that created the job.
pub(super) async fn fetch_video(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    routing: Option<Extension<RoutingContext>>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id(&headers);
    let routing = routing.map(|Extension(r)| r);
    let model = routing
        .as_ref()
        .map(|r| r.model.clone())
        .unwrap_or_else(|| state.config.default_video_model.clone());
    relay(
        &state,
        &headers,
        request_id,
        CanonicalRequest::video_fetch(model, task_id),
        routing,
    )
    .await
}

async fn relay(
    state: &AppState,
    headers: &HeaderMap,
    request_id: String,
    request: CanonicalRequest,
    routing: Option<RoutingContext>,
) -> Response {
    let ctx = DispatchContext::new(
        request_id.clone(),
        request_user(headers),
        state.config.request_timeout,
    )
    .with_routing(routing);

    tracing::debug!(
        request_id = %request_id,
        model = %request.model,
        mode = %request.mode,
        stream = request.stream,
        pinned = ctx.routing.is_some(),
        "Relaying request"
    );

    match state.dispatcher.dispatch(&request, &ctx).await {
        Ok(Dispatched::Complete { response, .. }) => {
            let resp = match response.to_openai_json() {
                Some(body) => Json(body).into_response(),
                None => match response.output {
                    ResponseOutput::Speech {
                        content_type,
                        audio,
                    } => ([(header::CONTENT_TYPE, content_type)], audio).into_response(),
                    _ => StatusCode::NO_CONTENT.into_response(),
                },
            };
            with_request_id(resp, &request_id)
        }
        Ok(Dispatched::Streaming { stream, .. }) => {
            let envelope = ChunkEnvelope::new(
                request.model.clone(),
                request.mode,
                request.reasoning_format,
            );
            with_request_id(sse_response(stream, envelope), &request_id)
        }
        Err(failure) => failure_response(&failure),
    }
}

/// Render canonical chunks as OpenAI SSE frames followed by `[DONE]`.
fn sse_response(stream: ChunkStream, envelope: ChunkEnvelope) -> Response {
    let body = async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let frame = format!("data: {}\n\n", envelope.render(&chunk));
                    yield Ok::<_, std::io::Error>(Bytes::from(frame));
                }
                Err(e) => {
                    let payload = json!({
                        "error": {
                            "message": e.to_string(),
                            "type": e.kind().to_string(),
                            "code": error_code(&e),
                        }
                    });
                    yield Ok(Bytes::from(format!("data: {}\n\n", payload)));
                    break;
                }
            }
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_EVENT_STREAM));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    response
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidRequest(format!("Invalid request body: {}", e)))
}

/// Honour a caller-supplied request id, otherwise mint one.
pub(super) fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()))
}

fn request_user(headers: &HeaderMap) -> RequestUser {
    let id = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };
    RequestUser {
        user_id: id(USER_ID_HEADER),
        token_id: id(TOKEN_ID_HEADER),
    }
}

pub(super) fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn failure_response(failure: &DispatchFailure) -> Response {
    let level_error = matches!(
        failure.error.kind(),
        crate::error::ErrorKind::Configuration | crate::error::ErrorKind::Internal
    );
    if level_error {
        tracing::error!(request_id = %failure.request_id, error = %failure.error, "Relay failed");
    } else {
        tracing::info!(request_id = %failure.request_id, error = %failure.error, "Relay failed");
    }
    error_response(&failure.request_id, &failure.error)
}

/// `{"error": {message, type, code, request_id[, upstream]}}`. A rejected
/// request carries the provider's body unchanged under `upstream` and
/// mirrors its status.
pub(super) fn error_response(request_id: &str, error: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": {
            "message": error.to_string(),
            "type": error.kind().to_string(),
            "code": error_code(error),
            "request_id": request_id,
        }
    });
    if let RelayError::UpstreamRejected { body: raw, .. } = error {
        let upstream = serde_json::from_slice::<Value>(raw)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(raw).into_owned()));
        body["error"]["upstream"] = upstream;
    }
    with_request_id((status, Json(body)).into_response(), request_id)
}

fn error_code(error: &RelayError) -> &'static str {
    match error {
        RelayError::NoEligibleChannel { .. } => "no_eligible_channel",
        RelayError::ChannelsCoolingDown { .. } => "channels_cooling_down",
        RelayError::Configuration(_) => "configuration_error",
        RelayError::UpstreamUnavailable { .. } => "upstream_unavailable",
        RelayError::UpstreamRejected { .. } => "upstream_rejected",
        RelayError::ChannelsExhausted { .. } => "channels_exhausted",
        RelayError::BindingConflict(_) => "binding_conflict",
        RelayError::BindingNotFound(_) => "binding_not_found",
        RelayError::InvalidRequest(_) => "invalid_request",
        RelayError::Parse(_) => "upstream_parse_error",
        RelayError::Storage(_) => "storage_error",
        RelayError::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rejected_error_mirrors_upstream() {
        let error = RelayError::UpstreamRejected {
            status: 422,
            message: "bad prompt".into(),
            body: Bytes::from_static(br#"{"error":{"message":"bad prompt","code":"x"}}"#),
        };
        let response = error_response("req-1", &error);
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-1");
        let v = body_json(response).await;
        assert_eq!(v["error"]["type"], "upstream_rejected");
        assert_eq!(v["error"]["request_id"], "req-1");
        assert_eq!(v["error"]["upstream"]["error"]["code"], "x");
    }

    #[tokio::test]
    async fn configuration_errors_have_no_upstream() {
        let error = RelayError::NoEligibleChannel {
            model: "gpt-x".into(),
        };
        let response = error_response("req-2", &error);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let v = body_json(response).await;
        assert_eq!(v["error"]["code"], "no_eligible_channel");
        assert!(v["error"].get("upstream").is_none());
    }

    #[test]
    fn request_identity_comes_from_headers() {
        let mut headers = HeaderMap::new();
        assert!(request_id(&headers).starts_with("req_"));
        assert_eq!(request_user(&headers), RequestUser::default());

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc"));
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("42"));
        headers.insert(TOKEN_ID_HEADER, HeaderValue::from_static("nope"));
        assert_eq!(request_id(&headers), "abc");
        assert_eq!(
            request_user(&headers),
            RequestUser {
                user_id: 42,
                token_id: 0
            }
        );
    }
}
