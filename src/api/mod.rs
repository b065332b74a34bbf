//! HTTP API for the relay gateway.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - Chat completion (unary or SSE)
//! - `POST /v1/completions` - Legacy text completion
//! - `POST /v1/rerank` - Rerank documents against a query
//! - `POST /v1/audio/speech` - Text to speech (binary reply)
//! - `POST /v1/videos` - Start a video generation job
//! - `GET /v1/videos/{task_id}` - Poll a video job on the channel that started it
//! - `GET /v1/models` - Models served by enabled channels
//! - `GET /api/channels/health` - Channel health, bans and recent failovers
//! - `POST /api/channels/reload` - Re-read the channels file
//! - `POST /api/channels/{id}/ban` - Ban a channel
//! - `DELETE /api/channels/{id}/ban` - Lift a ban
//! - `POST /api/channels/{id}/clear-cooldown` - Reset a channel's cooldown
//! - `GET /health` - Liveness

mod binding;
mod channels;
mod relay;
mod routes;

pub use routes::{build_state, router, serve, AppState};
