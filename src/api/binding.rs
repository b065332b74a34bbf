//! Task binding middleware for video polls.

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::RelayError;
use crate::task_binding::BindingError;

use super::relay::{error_response, request_id};
use super::routes::AppState;

/// Attach a `RoutingContext` when the polled task id is bound. An unknown
/// task id leaves the request untouched.
pub(super) async fn resolve_task_binding(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.dispatcher.bindings().resolve(&task_id).await {
        Ok(binding) => {
            tracing::debug!(
                task_id = %task_id,
                channel_id = binding.channel_id,
                model = %binding.actual_model,
                "Routing poll to bound channel"
            );
            request.extensions_mut().insert(binding.routing());
        }
        Err(BindingError::NotFound(_)) => {
            tracing::debug!(task_id = %task_id, "No binding for task, routing normally");
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "Task binding lookup failed");
            let request_id = request_id(request.headers());
            let error: RelayError = e.into();
            return error_response(&request_id, &error);
        }
    }
    next.run(request).await
}
