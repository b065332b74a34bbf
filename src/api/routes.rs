//! Router construction and server startup.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::adaptor::{AdaptorRegistry, AdaptorSettings};
use crate::channel::ChannelStore;
use crate::channel_health::{BanSet, ChannelHealthTracker};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::pricing::{PricingCatalog, RatioResolver};
use crate::task_binding::open_binding_store;
use crate::usage::TracingUsageSink;

use super::binding;
use super::channels;
use super::relay;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub dispatcher: Dispatcher,
}

/// Construct every collaborator from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let channels = Arc::new(ChannelStore::load(config.channels_file.clone()).await?);

    let adaptors = AdaptorRegistry::with_defaults(&AdaptorSettings {
        gemini_api_version: config.gemini_api_version.clone(),
    })?;

    let catalog = PricingCatalog::builtin()?;
    let resolver = Arc::new(RatioResolver::new(catalog));

    let bindings = open_binding_store(config.database_path.clone()).await?;
    tracing::info!(
        persistent = bindings.is_persistent(),
        "Task binding store ready"
    );

    // Streaming replies must not be cut off by a whole-body timeout; the
    // dispatcher enforces the request deadline instead.
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()?;

    let dispatcher = Dispatcher::new(
        channels,
        adaptors,
        resolver,
        Arc::new(ChannelHealthTracker::new()),
        BanSet::new(),
        bindings,
        Arc::new(TracingUsageSink),
        client,
        DispatcherSettings {
            max_retries: config.retry_times,
        },
    );

    Ok(Arc::new(AppState { config, dispatcher }))
}

pub fn router(state: Arc<AppState>) -> Router {
    // The binding lookup needs the matched `:task_id`, so it is a route layer.
    let video_poll = Router::new()
        .route("/v1/videos/:task_id", get(relay::fetch_video))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            binding::resolve_task_binding,
        ));

    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/completions", post(relay::completions))
        .route("/v1/rerank", post(relay::rerank))
        .route("/v1/audio/speech", post(relay::speech))
        .route("/v1/videos", post(relay::create_video))
        .route("/v1/models", get(channels::list_models))
        .merge(video_poll);

    let admin_routes = Router::new()
        .route("/api/channels/health", get(channels::channel_health))
        .route("/api/channels/reload", post(channels::reload_channels))
        .route(
            "/api/channels/:id/ban",
            post(channels::ban_channel).delete(channels::unban_channel),
        )
        .route(
            "/api/channels/:id/clear-cooldown",
            post(channels::clear_cooldown),
        );

    Router::new()
        .route("/health", get(channels::health))
        .merge(relay_routes)
        .merge(admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
