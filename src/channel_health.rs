//! Channel health tracking, failover events and manual bans.
//!
//! Cooldowns use exponential backoff per channel. The dispatcher skips
//! channels in cooldown unless a request is pinned to one by a task binding.
//! Bans are operator decisions and always win.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::channel::ChannelType;
use crate::error::UnavailableReason;

/// Health state for a single channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelHealth {
    /// When the cooldown expires (None = healthy).
    pub cooldown_until: Option<Instant>,
    /// Number of consecutive failures (for exponential backoff).
    pub consecutive_failures: u32,
    pub last_failure_reason: Option<UnavailableReason>,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_requests: u64,
    pub total_successes: u64,
    /// Rate limits and overloads.
    pub total_rate_limits: u64,
    /// Every other failover-eligible failure.
    pub total_errors: u64,
    pub total_latency_ms: u64,
    pub latency_samples: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl ChannelHealth {
    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn remaining_cooldown(&self) -> Option<Duration> {
        self.cooldown_until.and_then(|until| {
            let now = Instant::now();
            if now < until {
                Some(until - now)
            } else {
                None
            }
        })
    }
}

/// Backoff parameters shared by every channel.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap for a healthy-but-flaky channel.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// After this many consecutive failures the channel is degraded and the
    /// cap becomes `max_delay × degraded_multiplier`.
    pub circuit_breaker_threshold: u32,
    pub degraded_multiplier: f64,
    /// Fixed cooldown for rejected credentials.
    pub auth_error_cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            circuit_breaker_threshold: 5,
            degraded_multiplier: 6.0,
            auth_error_cooldown: Duration::from_secs(3600),
        }
    }
}

impl BackoffConfig {
    /// Cooldown after `consecutive_failures` previous failures.
    pub fn cooldown_for(&self, consecutive_failures: u32) -> Duration {
        let delay_secs =
            self.base_delay.as_secs_f64() * self.multiplier.powi(consecutive_failures as i32);
        let cap = if consecutive_failures >= self.circuit_breaker_threshold {
            self.max_delay.as_secs_f64() * self.degraded_multiplier
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(delay_secs.min(cap))
    }
}

/// One failover: the dispatcher gave up on a channel and moved on.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    pub model: String,
    pub from_channel_id: i64,
    pub from_channel_type: ChannelType,
    pub reason: UnavailableReason,
    pub status: Option<u16>,
    pub cooldown_secs: f64,
    pub latency_ms: u64,
    /// 1-indexed attempt number.
    pub attempt_number: u32,
}

const MAX_FAILOVER_EVENTS: usize = 200;

/// Serializable health snapshot for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealthSnapshot {
    pub channel_id: i64,
    pub is_healthy: bool,
    pub cooldown_remaining_secs: Option<f64>,
    pub consecutive_failures: u32,
    pub last_failure_reason: Option<UnavailableReason>,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_rate_limits: u64,
    pub total_errors: u64,
    pub avg_latency_ms: Option<f64>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub is_degraded: bool,
}

/// Per-channel health tracker shared by the dispatcher and the admin API.
#[derive(Debug, Clone)]
pub struct ChannelHealthTracker {
    channels: Arc<RwLock<HashMap<i64, ChannelHealth>>>,
    backoff_config: BackoffConfig,
    failover_events: Arc<RwLock<Vec<FailoverEvent>>>,
}

impl Default for ChannelHealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHealthTracker {
    pub fn new() -> Self {
        Self::with_backoff(BackoffConfig::default())
    }

    pub fn with_backoff(backoff_config: BackoffConfig) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            backoff_config,
            failover_events: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Unknown channels are healthy.
    pub async fn is_healthy(&self, channel_id: i64) -> bool {
        self.channels
            .read()
            .await
            .get(&channel_id)
            .map(|h| !h.is_in_cooldown())
            .unwrap_or(true)
    }

    pub async fn record_success(&self, channel_id: i64, latency_ms: u64) {
        let mut channels = self.channels.write().await;
        let health = channels.entry(channel_id).or_default();
        health.total_requests += 1;
        health.total_successes += 1;
        health.total_latency_ms += latency_ms;
        health.latency_samples += 1;
        health.consecutive_failures = 0;
        health.cooldown_until = None;
    }

    /// Place a channel in cooldown. A provider-sent `retry_after` takes the
    /// place of the computed backoff. Returns the applied cooldown.
    pub async fn record_failure(
        &self,
        channel_id: i64,
        reason: UnavailableReason,
        retry_after: Option<Duration>,
    ) -> Duration {
        let mut channels = self.channels.write().await;
        let health = channels.entry(channel_id).or_default();

        health.total_requests += 1;
        match reason {
            UnavailableReason::RateLimit | UnavailableReason::Overloaded => {
                health.total_rate_limits += 1
            }
            _ => health.total_errors += 1,
        }
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure_reason = Some(reason);
        health.last_failure_at = Some(chrono::Utc::now());

        let cooldown = retry_after.unwrap_or_else(|| {
            if reason == UnavailableReason::AuthError {
                self.backoff_config.auth_error_cooldown
            } else {
                self.backoff_config
                    .cooldown_for(health.consecutive_failures.saturating_sub(1))
            }
        });
        health.cooldown_until = Some(Instant::now() + cooldown);

        if health.consecutive_failures >= self.backoff_config.circuit_breaker_threshold {
            tracing::warn!(
                channel_id,
                consecutive_failures = health.consecutive_failures,
                cooldown_secs = cooldown.as_secs_f64(),
                "Circuit breaker tripped, channel degraded"
            );
        } else {
            tracing::info!(
                channel_id,
                %reason,
                consecutive_failures = health.consecutive_failures,
                cooldown_secs = cooldown.as_secs_f64(),
                "Channel placed in cooldown"
            );
        }
        cooldown
    }

    pub async fn record_token_usage(&self, channel_id: i64, input_tokens: u64, output_tokens: u64) {
        let mut channels = self.channels.write().await;
        let health = channels.entry(channel_id).or_default();
        health.total_input_tokens += input_tokens;
        health.total_output_tokens += output_tokens;
    }

    pub async fn record_failover_event(&self, event: FailoverEvent) {
        let mut events = self.failover_events.write().await;
        events.push(event);
        if events.len() > MAX_FAILOVER_EVENTS {
            let excess = events.len() - MAX_FAILOVER_EVENTS;
            events.drain(..excess);
        }
    }

    /// Recent failover events, newest last.
    pub async fn recent_events(&self, limit: usize) -> Vec<FailoverEvent> {
        let events = self.failover_events.read().await;
        let start = events.len().saturating_sub(limit);
        events[start..].to_vec()
    }

    fn snapshot(
        channel_id: i64,
        health: &ChannelHealth,
        backoff_config: &BackoffConfig,
    ) -> ChannelHealthSnapshot {
        ChannelHealthSnapshot {
            channel_id,
            is_healthy: !health.is_in_cooldown(),
            cooldown_remaining_secs: health.remaining_cooldown().map(|d| d.as_secs_f64()),
            consecutive_failures: health.consecutive_failures,
            last_failure_reason: health.last_failure_reason,
            last_failure_at: health.last_failure_at,
            total_requests: health.total_requests,
            total_successes: health.total_successes,
            total_rate_limits: health.total_rate_limits,
            total_errors: health.total_errors,
            avg_latency_ms: if health.latency_samples > 0 {
                Some(health.total_latency_ms as f64 / health.latency_samples as f64)
            } else {
                None
            },
            total_input_tokens: health.total_input_tokens,
            total_output_tokens: health.total_output_tokens,
            is_degraded: health.consecutive_failures >= backoff_config.circuit_breaker_threshold,
        }
    }

    pub async fn get_health(&self, channel_id: i64) -> ChannelHealthSnapshot {
        let channels = self.channels.read().await;
        let default = ChannelHealth::default();
        let health = channels.get(&channel_id).unwrap_or(&default);
        Self::snapshot(channel_id, health, &self.backoff_config)
    }

    /// Returns false when the channel was never tracked.
    pub async fn clear_cooldown(&self, channel_id: i64) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get_mut(&channel_id) {
            Some(health) => {
                health.cooldown_until = None;
                health.consecutive_failures = 0;
                true
            }
            None => false,
        }
    }
}

pub type SharedChannelHealthTracker = Arc<ChannelHealthTracker>;

/// A manual ban placed by an operator.
#[derive(Debug, Clone, Serialize)]
pub struct BanEntry {
    pub channel_id: i64,
    pub reason: String,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Channels excluded from selection until unbanned.
#[derive(Debug, Clone, Default)]
pub struct BanSet {
    bans: Arc<RwLock<HashMap<i64, BanEntry>>>,
}

impl BanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the channel was already banned.
    pub async fn ban(&self, channel_id: i64, reason: impl Into<String>) -> bool {
        let mut bans = self.bans.write().await;
        if bans.contains_key(&channel_id) {
            return false;
        }
        let reason = reason.into();
        tracing::warn!(channel_id, reason = %reason, "Channel banned");
        bans.insert(
            channel_id,
            BanEntry {
                channel_id,
                reason,
                since: chrono::Utc::now(),
            },
        );
        true
    }

    pub async fn unban(&self, channel_id: i64) -> bool {
        let removed = self.bans.write().await.remove(&channel_id).is_some();
        if removed {
            tracing::info!(channel_id, "Channel ban lifted");
        }
        removed
    }

    pub async fn is_banned(&self, channel_id: i64) -> bool {
        self.bans.read().await.contains_key(&channel_id)
    }

    pub async fn snapshot(&self) -> Vec<BanEntry> {
        let mut bans: Vec<_> = self.bans.read().await.values().cloned().collect();
        bans.sort_by_key(|b| b.channel_id);
        bans
    }
}
