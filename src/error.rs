//! Relay error taxonomy with failover classification.
//!
//! Separates errors that should move the request to another channel
//! (transport failures, 5xx, bad channel credentials) from errors the
//! provider returned about the request itself, which are passed through.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Coarse error classes surfaced to callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No eligible channel, malformed pricing entry, unknown adaptor.
    Configuration,
    /// Network, timeout, 5xx; retried against alternate channels.
    UpstreamUnavailable,
    /// Semantic error from the provider; never retried.
    UpstreamRejected,
    /// Duplicate task id at binding creation.
    BindingConflict,
    /// Unknown task id at binding resolution.
    BindingNotFound,
    /// Malformed inbound request.
    InvalidRequest,
    /// Anything else raised inside the gateway.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration_error"),
            Self::UpstreamUnavailable => write!(f, "upstream_unavailable"),
            Self::UpstreamRejected => write!(f, "upstream_rejected"),
            Self::BindingConflict => write!(f, "binding_conflict"),
            Self::BindingNotFound => write!(f, "binding_not_found"),
            Self::InvalidRequest => write!(f, "invalid_request_error"),
            Self::Internal => write!(f, "internal_error"),
        }
    }
}

/// Why a channel was judged unavailable. Drives cooldown length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// HTTP 429 without a quota-exhausted code
    RateLimit,
    /// HTTP 529 or an "overloaded" error body
    Overloaded,
    /// Connect or read timeout, or the caller's deadline passed
    Timeout,
    /// Connection failure or broken stream
    Network,
    /// Server error (5xx other than 529)
    ServerError,
    /// 401/403: channel credentials are wrong
    AuthError,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::Timeout => write!(f, "timeout"),
            Self::Network => write!(f, "network"),
            Self::ServerError => write!(f, "server_error"),
            Self::AuthError => write!(f, "auth_error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no eligible channel serves model '{model}'")]
    NoEligibleChannel { model: String },

    #[error("all {count} channels serving model '{model}' are cooling down")]
    ChannelsCoolingDown { model: String, count: usize },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("upstream unavailable ({reason}): {message}")]
    UpstreamUnavailable {
        reason: UnavailableReason,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream rejected the request (HTTP {status}): {message}")]
    UpstreamRejected {
        status: u16,
        message: String,
        body: Bytes,
    },

    #[error("all {attempts} channel attempts failed; last error: {last}")]
    ChannelsExhausted { attempts: u32, last: Box<RelayError> },

    #[error("task id '{0}' is already bound to a channel")]
    BindingConflict(String),

    #[error("no binding for task id '{0}'")]
    BindingNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to parse upstream response: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("request cancelled")]
    Cancelled,
}

impl RelayError {
    pub fn unavailable(reason: UnavailableReason, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            reason,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout() -> Self {
        Self::unavailable(UnavailableReason::Timeout, "deadline exceeded")
    }

    /// Map a reqwest transport error (no HTTP status received).
    pub fn from_transport(e: &reqwest::Error) -> Self {
        let reason = if e.is_timeout() {
            UnavailableReason::Timeout
        } else {
            UnavailableReason::Network
        };
        Self::unavailable(reason, e.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoEligibleChannel { .. } | Self::Configuration(_) => ErrorKind::Configuration,
            Self::ChannelsCoolingDown { .. } | Self::UpstreamUnavailable { .. } => {
                ErrorKind::UpstreamUnavailable
            }
            Self::UpstreamRejected { .. } => ErrorKind::UpstreamRejected,
            Self::ChannelsExhausted { last, .. } => last.kind(),
            Self::BindingConflict(_) => ErrorKind::BindingConflict,
            Self::BindingNotFound(_) => ErrorKind::BindingNotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Parse(_) | Self::Storage(_) | Self::Cancelled => ErrorKind::Internal,
        }
    }

    /// Whether the dispatcher should try the next channel.
    pub fn is_failover_eligible(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    pub fn unavailable_reason(&self) -> Option<UnavailableReason> {
        match self {
            Self::UpstreamUnavailable { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpstreamUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status presented to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoEligibleChannel { .. } => 503,
            Self::ChannelsCoolingDown { .. } => 429,
            Self::Configuration(_) => 500,
            Self::UpstreamUnavailable { reason, .. } => match reason {
                UnavailableReason::Timeout => 504,
                _ => 502,
            },
            Self::UpstreamRejected { status, .. } => *status,
            Self::ChannelsExhausted { last, .. } => last.status_code(),
            Self::BindingConflict(_) => 409,
            Self::BindingNotFound(_) => 404,
            Self::InvalidRequest(_) => 400,
            Self::Parse(_) => 502,
            Self::Storage(_) => 500,
            Self::Cancelled => 499,
        }
    }
}

/// A dispatch failure annotated with the request id for correlation.
#[derive(Debug, Error)]
#[error("{error} (request id: {request_id})")]
pub struct DispatchFailure {
    pub request_id: String,
    #[source]
    pub error: RelayError,
}

impl DispatchFailure {
    pub fn new(request_id: impl Into<String>, error: RelayError) -> Self {
        Self {
            request_id: request_id.into(),
            error,
        }
    }
}

/// Classify a non-success upstream HTTP status plus body.
///
/// `401/403` mean the channel itself is misconfigured, so they fail over
/// like transport errors. A `429` only fails over when it is a rate limit;
/// an exhausted provider-side quota is the caller's problem.
pub fn classify_http_status(status: u16, body: &[u8], retry_after: Option<Duration>) -> RelayError {
    let message = upstream_error_message(body).unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text.is_empty() {
            format!("HTTP {}", status)
        } else {
            text.chars().take(512).collect()
        }
    });
    let unavailable = |reason| RelayError::UpstreamUnavailable {
        reason,
        status: Some(status),
        message: message.clone(),
        retry_after,
    };
    match status {
        429 if is_quota_exhausted(body) => RelayError::UpstreamRejected {
            status,
            message,
            body: Bytes::copy_from_slice(body),
        },
        429 => unavailable(UnavailableReason::RateLimit),
        529 => unavailable(UnavailableReason::Overloaded),
        401 | 403 => unavailable(UnavailableReason::AuthError),
        408 => unavailable(UnavailableReason::Timeout),
        400..=499 => RelayError::UpstreamRejected {
            status,
            message,
            body: Bytes::copy_from_slice(body),
        },
        _ => unavailable(UnavailableReason::ServerError),
    }
}

/// Pull a human-readable message out of the usual provider error shapes:
/// `{"error": {"message": ..}}`, `{"error": ".."}`, `{"message": ..}`,
/// `{"msg": ..}` (Zhipu legacy).
pub fn upstream_error_message(body: &[u8]) -> Option<String> {
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let from_error = v.get("error").and_then(|e| {
        e.get("message")
            .and_then(|m| m.as_str())
            .or_else(|| e.as_str())
    });
    from_error
        .or_else(|| v.get("message").and_then(|m| m.as_str()))
        .or_else(|| v.get("msg").and_then(|m| m.as_str()))
        .map(str::to_string)
}

fn is_quota_exhausted(body: &[u8]) -> bool {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };
    let Some(err) = v.get("error") else {
        return false;
    };
    ["code", "type"].iter().any(|k| {
        err.get(*k)
            .and_then(|c| c.as_str())
            .map(|c| c.eq_ignore_ascii_case("insufficient_quota"))
            .unwrap_or(false)
    })
}

/// Classify an error embedded in an otherwise successful body or stream frame.
pub fn classify_embedded_error(v: &serde_json::Value) -> RelayError {
    let error_obj = v.get("error");
    let error_type = error_obj
        .and_then(|e| {
            e.get("type")
                .or_else(|| e.get("code"))
                .or_else(|| e.get("status"))
                .and_then(|t| t.as_str())
        })
        .unwrap_or("")
        .to_ascii_lowercase();
    let message = error_obj
        .and_then(|e| e.get("message").and_then(|m| m.as_str()))
        .unwrap_or("upstream reported an error")
        .to_string();

    let reason = if error_type.contains("rate_limit") || error_type.contains("resource_exhausted")
    {
        Some(UnavailableReason::RateLimit)
    } else if error_type.contains("overload") {
        Some(UnavailableReason::Overloaded)
    } else if error_type.contains("auth") || error_type.contains("permission") {
        Some(UnavailableReason::AuthError)
    } else if error_type.contains("invalid_request") {
        None
    } else {
        match error_obj.and_then(|e| e.get("code")).and_then(|c| c.as_i64()) {
            Some(429) => Some(UnavailableReason::RateLimit),
            Some(529) => Some(UnavailableReason::Overloaded),
            Some(401) | Some(403) => Some(UnavailableReason::AuthError),
            Some(400..=499) => None,
            _ => Some(UnavailableReason::ServerError),
        }
    };

    match reason {
        Some(reason) => RelayError::unavailable(reason, message),
        None => RelayError::UpstreamRejected {
            status: 400,
            message,
            body: Bytes::from(v.to_string()),
        },
    }
}
