//! Channel admin endpoints, model listing and liveness.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::channel::ChannelType;
use crate::channel_health::{BanEntry, ChannelHealthSnapshot, FailoverEvent};

use super::routes::AppState;

const RECENT_FAILOVERS: usize = 50;

#[derive(Debug, Serialize)]
struct ChannelStatusView {
    id: i64,
    name: String,
    channel_type: ChannelType,
    enabled: bool,
    banned: bool,
    priority: i64,
    weight: u32,
    health: ChannelHealthSnapshot,
}

#[derive(Debug, Serialize)]
pub(super) struct HealthReport {
    channels: Vec<ChannelStatusView>,
    bans: Vec<BanEntry>,
    recent_failovers: Vec<FailoverEvent>,
    ratio_fallbacks: u64,
}

pub(super) async fn channel_health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let dispatcher = &state.dispatcher;
    let mut channels = Vec::new();
    for channel in dispatcher.channels().list().await.iter() {
        channels.push(ChannelStatusView {
            id: channel.id,
            name: channel.name.clone(),
            channel_type: channel.channel_type,
            enabled: channel.is_enabled(),
            banned: dispatcher.bans().is_banned(channel.id).await,
            priority: channel.priority,
            weight: channel.weight,
            health: dispatcher.health().get_health(channel.id).await,
        });
    }
    Json(HealthReport {
        channels,
        bans: dispatcher.bans().snapshot().await,
        recent_failovers: dispatcher.health().recent_events(RECENT_FAILOVERS).await,
        ratio_fallbacks: dispatcher.resolver().fallback_count(),
    })
}

pub(super) async fn reload_channels(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher.channels().reload().await {
        Ok(count) => {
            tracing::info!(count, "Reloaded channels");
            Json(json!({ "channels": count })).into_response()
        }
        Err(e) => {
            tracing::warn!("Channel reload failed, keeping previous list: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "message": e.to_string(), "type": "configuration_error" } })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct BanRequest {
    #[serde(default)]
    reason: Option<String>,
}

fn channel_not_found(id: i64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "message": format!("channel {} not found", id), "type": "not_found" } })),
    )
        .into_response()
}

pub(super) async fn ban_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<BanRequest>>,
) -> Response {
    if state.dispatcher.channels().get(id).await.is_none() {
        return channel_not_found(id);
    }
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "banned by operator".to_string());
    let newly_banned = state.dispatcher.bans().ban(id, reason).await;
    Json(json!({ "channel_id": id, "banned": true, "changed": newly_banned })).into_response()
}

pub(super) async fn unban_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    if state.dispatcher.channels().get(id).await.is_none() {
        return channel_not_found(id);
    }
    let lifted = state.dispatcher.bans().unban(id).await;
    Json(json!({ "channel_id": id, "banned": false, "changed": lifted })).into_response()
}

pub(super) async fn clear_cooldown(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    if state.dispatcher.channels().get(id).await.is_none() {
        return channel_not_found(id);
    }
    let cleared = state.dispatcher.health().clear_cooldown(id).await;
    Json(json!({ "channel_id": id, "cleared": cleared })).into_response()
}

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    owned_by: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelObject>,
}

/// Models explicitly listed or mapped by enabled, unbanned channels.
pub(super) async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let dispatcher = &state.dispatcher;
    let mut models: BTreeMap<String, ChannelType> = BTreeMap::new();
    for channel in dispatcher.channels().list().await.iter() {
        if !channel.is_enabled() || dispatcher.bans().is_banned(channel.id).await {
            continue;
        }
        for model in channel.models.iter().chain(channel.model_mapping.keys()) {
            models.entry(model.clone()).or_insert(channel.channel_type);
        }
    }
    Json(ModelsResponse {
        object: "list",
        data: models
            .into_iter()
            .map(|(id, channel_type)| ModelObject {
                id,
                object: "model",
                owned_by: channel_type.id().to_string(),
            })
            .collect(),
    })
}

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
