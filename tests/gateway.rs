//! End-to-end tests: a fake OpenAI-compatible upstream and the gateway, both
//! on ephemeral ports, driven over HTTP.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

use relay_gateway::api;
use relay_gateway::config::Config;

type CallLog = Arc<Mutex<Vec<String>>>;

fn auth(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": {"message": "upstream down", "type": "server_error"}})),
    )
        .into_response()
}

async fn fake_chat(
    State(log): State<CallLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let key = auth(&headers);
    log.lock().unwrap().push(format!("chat {}", key));
    match key.as_str() {
        "Bearer sk-down" => return unavailable(),
        "Bearer sk-reject" => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "prompt too long", "type": "invalid_request_error", "code": "context_length_exceeded"}})),
            )
                .into_response()
        }
        _ => {}
    }

    if body["stream"] == json!(true) {
        let frames = [
            json!({"id": "c1", "object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "po"}, "finish_reason": null}]}),
            json!({"id": "c1", "object": "chat.completion.chunk", "choices": [{"index": 0, "delta": {"content": "ng"}, "finish_reason": "stop"}]}),
            json!({"id": "c1", "object": "chat.completion.chunk", "choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}}),
        ];
        let mut sse = String::new();
        for frame in frames {
            sse.push_str(&format!("data: {}\n\n", frame));
        }
        sse.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "created": 1,
        "model": body["model"],
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    }))
    .into_response()
}

async fn fake_create_video(
    State(log): State<CallLog>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let key = auth(&headers);
    log.lock()
        .unwrap()
        .push(format!("video {} {}", key, body["seconds"].as_str().unwrap_or("")));
    if key == "Bearer sk-down" {
        return unavailable();
    }
    Json(json!({
        "id": "video_123",
        "object": "video",
        "model": body["model"],
        "status": "queued",
        "seconds": body["seconds"],
        "created_at": 1
    }))
    .into_response()
}

async fn fake_poll_video(
    State(log): State<CallLog>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let key = auth(&headers);
    log.lock().unwrap().push(format!("poll {} {}", id, key));
    if key == "Bearer sk-down" {
        return unavailable();
    }
    Json(json!({
        "id": id,
        "object": "video",
        "model": "sora-2",
        "status": "completed",
        "progress": 100,
        "video_url": "https://cdn.example/video_123.mp4",
        "created_at": 1
    }))
    .into_response()
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct Harness {
    gateway: String,
    calls: CallLog,
    client: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let upstream = spawn(
            Router::new()
                .route("/v1/chat/completions", post(fake_chat))
                .route("/v1/videos", post(fake_create_video))
                .route("/v1/videos/:id", get(fake_poll_video))
                .with_state(Arc::clone(&calls)),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let base_url = format!("{}/v1", upstream);
        let channels = json!([
            {"id": 1, "type": "openai", "name": "flaky", "base_url": base_url, "api_key": "sk-down",
             "models": ["gpt-4o", "sora-2"], "priority": 10},
            {"id": 2, "type": "openai", "name": "steady", "base_url": base_url, "api_key": "sk-good",
             "models": ["gpt-4o", "sora-2"], "priority": 5},
            {"id": 3, "type": "custom", "name": "strict", "base_url": base_url, "api_key": "sk-reject",
             "models": ["strict-model"]}
        ]);
        let channels_file = dir.path().join("channels.json");
        std::fs::write(&channels_file, channels.to_string()).unwrap();

        let config = Config {
            channels_file,
            database_path: Some(dir.path().join("relay.db")),
            ..Config::default()
        };
        let state = api::build_state(config).await.unwrap();
        let gateway = spawn(api::router(state)).await;

        Self {
            gateway,
            calls,
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.gateway, path)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn chat_fails_over_to_healthy_channel() {
    let h = Harness::start().await;
    let resp = h
        .client
        .post(h.url("/v1/chat/completions"))
        .header("x-request-id", "it-chat-1")
        .header("x-relay-user-id", "42")
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "ping"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-request-id"], "it-chat-1");
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["usage"]["prompt_tokens"], 3);

    assert_eq!(h.calls(), vec!["chat Bearer sk-down", "chat Bearer sk-good"]);

    let health: Value = h
        .client
        .get(h.url("/api/channels/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let failovers = health["recent_failovers"].as_array().unwrap();
    assert_eq!(failovers.len(), 1);
    assert_eq!(failovers[0]["from_channel_id"], 1);
    assert_eq!(failovers[0]["request_id"], "it-chat-1");
    let flaky = health["channels"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["id"] == 1)
        .unwrap();
    assert_eq!(flaky["health"]["is_healthy"], false);
}

#[tokio::test]
async fn streaming_chat_is_rendered_as_sse() {
    let h = Harness::start().await;
    // Ban the failing channel so the stream comes straight from channel 2.
    let resp = h
        .client
        .post(h.url("/api/channels/1/ban"))
        .json(&json!({"reason": "maintenance"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .post(h.url("/v1/chat/completions"))
        .json(&json!({"model": "gpt-4o", "stream": true, "messages": [{"role": "user", "content": "ping"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let text = resp.text().await.unwrap();

    let payloads: Vec<Value> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();
    let content: String = payloads
        .iter()
        .filter_map(|p| p["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "pong");
    assert!(payloads.iter().any(|p| p["usage"]["completion_tokens"] == 1));
    assert!(text.trim_end().ends_with("data: [DONE]"));
    assert_eq!(h.calls(), vec!["chat Bearer sk-good"]);
}

#[tokio::test]
async fn unbound_video_poll_is_routed_normally() {
    let h = Harness::start().await;
    let resp = h
        .client
        .get(h.url("/v1/videos/video_unknown"))
        .header("x-request-id", "it-unbound")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let polled: Value = resp.json().await.unwrap();
    assert_eq!(polled["id"], "video_unknown");
    assert_eq!(polled["status"], "completed");

    // Not pinned: priority order applies, so the flaky channel is tried
    // first and the poll fails over.
    assert_eq!(
        h.calls(),
        vec![
            "poll video_unknown Bearer sk-down",
            "poll video_unknown Bearer sk-good"
        ]
    );
}

#[tokio::test]
async fn video_poll_returns_to_the_creating_channel() {
    let h = Harness::start().await;

    // Put channel 1 into cooldown so creation lands on channel 2.
    h.client
        .post(h.url("/v1/chat/completions"))
        .json(&json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "warm up"}]}))
        .send()
        .await
        .unwrap();

    let resp = h
        .client
        .post(h.url("/v1/videos"))
        .json(&json!({"prompt": "a cat surfing", "seconds": "8", "duration": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let job: Value = resp.json().await.unwrap();
    assert_eq!(job["id"], "video_123");
    assert_eq!(job["model"], "sora-2");

    // Channel 1 is now healthy and preferred, but the poll is pinned.
    let resp = h
        .client
        .post(h.url("/api/channels/1/clear-cooldown"))
        .send()
        .await
        .unwrap();
    let cleared: Value = resp.json().await.unwrap();
    assert_eq!(cleared["cleared"], true);

    let resp = h
        .client
        .get(h.url("/v1/videos/video_123"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let polled: Value = resp.json().await.unwrap();
    assert_eq!(polled["status"], "completed");
    assert_eq!(polled["video_url"], "https://cdn.example/video_123.mp4");

    let calls = h.calls();
    assert!(calls.contains(&"video Bearer sk-good 8".to_string()));
    assert_eq!(calls.last().unwrap(), "poll video_123 Bearer sk-good");
    assert!(!calls.iter().any(|c| c.starts_with("poll") && c.ends_with("sk-down")));
}

#[tokio::test]
async fn rejected_request_passes_upstream_error_through() {
    let h = Harness::start().await;
    let resp = h
        .client
        .post(h.url("/v1/chat/completions"))
        .header("x-request-id", "it-reject")
        .json(&json!({"model": "strict-model", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_rejected");
    assert_eq!(body["error"]["request_id"], "it-reject");
    assert_eq!(
        body["error"]["upstream"]["error"]["code"],
        "context_length_exceeded"
    );
    assert_eq!(h.calls(), vec!["chat Bearer sk-reject"]);
}

#[tokio::test]
async fn unknown_model_has_no_eligible_channel() {
    let h = Harness::start().await;
    let resp = h
        .client
        .post(h.url("/v1/chat/completions"))
        .json(&json!({"model": "no-such-model", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "configuration_error");
    assert_eq!(body["error"]["code"], "no_eligible_channel");
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn models_and_liveness() {
    let h = Harness::start().await;
    let models: Value = h
        .client
        .get(h.url("/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "sora-2", "strict-model"]);

    let resp = h.client.get(h.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = h
        .client
        .post(h.url("/api/channels/99/ban"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn malformed_body_is_an_invalid_request() {
    let h = Harness::start().await;
    let resp = h
        .client
        .post(h.url("/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
