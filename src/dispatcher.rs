//! Channel selection, failover and metering for relayed requests.
//!
//! One `dispatch` call picks eligible channels for the requested model,
//! tries them in priority/weight order, cools down channels that fail with
//! a failover-eligible error, and on success creates the task binding (if
//! the reply started an async job) and emits exactly one usage record.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adaptor::{Adaptor, AdaptorRegistry, ChunkStream, UpstreamReply, UpstreamTarget};
use crate::channel::{Channel, ChannelType, RatioOverrides, SharedChannelStore};
use crate::channel_health::{BanSet, FailoverEvent, SharedChannelHealthTracker};
use crate::error::{DispatchFailure, RelayError};
use crate::pricing::{QuotaBreakdown, RatioResolver};
use crate::relay::{
    estimate_tokens, CanonicalRequest, CanonicalResponse, ResponseOutput, StreamChunk, Usage,
};
use crate::task_binding::{
    BindingError, NewBinding, RoutingContext, SharedBindingStore, TaskType,
};
use crate::usage::{UsageRecord, UsageSink};

/// Tunables read from configuration.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Extra attempts after the first one.
    pub max_retries: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Caller identity, resolved by the auth layer in front of the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestUser {
    pub user_id: i64,
    pub token_id: i64,
}

/// Per-request dispatch state.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub request_id: String,
    pub user: RequestUser,
    /// Set by the binding middleware for polls of a known task.
    pub routing: Option<RoutingContext>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl DispatchContext {
    pub fn new(request_id: impl Into<String>, user: RequestUser, timeout: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            user,
            routing: None,
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_routing(mut self, routing: Option<RoutingContext>) -> Self {
        self.routing = routing;
        self
    }
}

/// Successful dispatch.
pub enum Dispatched {
    Complete {
        response: CanonicalResponse,
        channel_id: i64,
        quota: i64,
    },
    /// Usage for a stream is recorded when the stream ends or is dropped.
    Streaming {
        stream: ChunkStream,
        channel_id: i64,
        upstream_model: String,
    },
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete {
                response,
                channel_id,
                quota,
            } => f
                .debug_struct("Complete")
                .field("response", response)
                .field("channel_id", channel_id)
                .field("quota", quota)
                .finish(),
            Self::Streaming { channel_id, .. } => f
                .debug_struct("Streaming")
                .field("channel_id", channel_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
struct Candidate {
    channel: Channel,
    adaptor: Arc<dyn Adaptor>,
    upstream_model: String,
}

pub struct Dispatcher {
    channels: SharedChannelStore,
    adaptors: AdaptorRegistry,
    resolver: Arc<RatioResolver>,
    health: SharedChannelHealthTracker,
    bans: BanSet,
    bindings: SharedBindingStore,
    usage: Arc<dyn UsageSink>,
    client: reqwest::Client,
    settings: DispatcherSettings,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: SharedChannelStore,
        adaptors: AdaptorRegistry,
        resolver: Arc<RatioResolver>,
        health: SharedChannelHealthTracker,
        bans: BanSet,
        bindings: SharedBindingStore,
        usage: Arc<dyn UsageSink>,
        client: reqwest::Client,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            channels,
            adaptors,
            resolver,
            health,
            bans,
            bindings,
            usage,
            client,
            settings,
        }
    }

    pub fn channels(&self) -> &SharedChannelStore {
        &self.channels
    }

    pub fn health(&self) -> &SharedChannelHealthTracker {
        &self.health
    }

    pub fn bans(&self) -> &BanSet {
        &self.bans
    }

    pub fn bindings(&self) -> &SharedBindingStore {
        &self.bindings
    }

    pub fn resolver(&self) -> &Arc<RatioResolver> {
        &self.resolver
    }

    /// Relay one request. Every failure carries `ctx.request_id`.
    pub async fn dispatch(
        &self,
        request: &CanonicalRequest,
        ctx: &DispatchContext,
    ) -> Result<Dispatched, DispatchFailure> {
        let fail = |error: RelayError| DispatchFailure::new(ctx.request_id.clone(), error);

        let candidates = self.candidates(request, ctx).await.map_err(fail)?;
        let max_attempts = 1 + self.settings.max_retries as usize;
        let mut last_error: Option<RelayError> = None;
        let mut attempts = 0u32;

        for candidate in candidates.into_iter().take(max_attempts) {
            if ctx.cancel.is_cancelled() {
                return Err(fail(RelayError::Cancelled));
            }
            if Instant::now() >= ctx.deadline {
                last_error = Some(RelayError::timeout());
                break;
            }
            attempts += 1;

            let started = std::time::Instant::now();
            let target = UpstreamTarget {
                channel: &candidate.channel,
                model: &candidate.upstream_model,
            };
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(RelayError::Cancelled),
                result = tokio::time::timeout_at(
                    ctx.deadline,
                    candidate.adaptor.invoke(&self.client, &target, request),
                ) => result.unwrap_or_else(|_| Err(RelayError::timeout())),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(reply) => {
                    self.health
                        .record_success(candidate.channel.id, latency_ms)
                        .await;
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        channel_id = candidate.channel.id,
                        model = %request.model,
                        latency_ms,
                        attempt = attempts,
                        "Upstream call succeeded"
                    );
                    return self
                        .complete(request, ctx, &candidate, reply, started)
                        .await
                        .map_err(fail);
                }
                Err(RelayError::Cancelled) => return Err(fail(RelayError::Cancelled)),
                Err(e) if e.is_failover_eligible() => {
                    let reason = match e.unavailable_reason() {
                        Some(reason) => reason,
                        None => return Err(fail(e)),
                    };
                    let cooldown = self
                        .health
                        .record_failure(candidate.channel.id, reason, e.retry_after())
                        .await;
                    let status = match &e {
                        RelayError::UpstreamUnavailable { status, .. } => *status,
                        _ => None,
                    };
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        channel_id = candidate.channel.id,
                        channel_type = %candidate.channel.channel_type,
                        model = %request.model,
                        %reason,
                        latency_ms,
                        error = %e,
                        "Channel unavailable, failing over"
                    );
                    self.health
                        .record_failover_event(FailoverEvent {
                            timestamp: chrono::Utc::now(),
                            request_id: ctx.request_id.clone(),
                            model: request.model.clone(),
                            from_channel_id: candidate.channel.id,
                            from_channel_type: candidate.channel.channel_type,
                            reason,
                            status,
                            cooldown_secs: cooldown.as_secs_f64(),
                            latency_ms,
                            attempt_number: attempts,
                        })
                        .await;
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        channel_id = candidate.channel.id,
                        model = %request.model,
                        kind = %e.kind(),
                        error = %e,
                        "Upstream rejected request"
                    );
                    return Err(fail(e));
                }
            }
        }

        let last = last_error.unwrap_or_else(RelayError::timeout);
        tracing::error!(
            request_id = %ctx.request_id,
            model = %request.model,
            attempts,
            error = %last,
            "All channel attempts failed"
        );
        Err(fail(RelayError::ChannelsExhausted {
            attempts,
            last: Box::new(last),
        }))
    }

    /// Eligible channels in attempt order.
    async fn candidates(
        &self,
        request: &CanonicalRequest,
        ctx: &DispatchContext,
    ) -> Result<Vec<Candidate>, RelayError> {
        let channels = self.channels.list().await;

        if let Some(routing) = &ctx.routing {
            // A pinned poll must go to the channel holding the job, even
            // while that channel is cooling down.
            let mut candidate = None;
            if let Some(channel) = channels
                .iter()
                .find(|c| c.id == routing.channel_id && c.is_enabled())
            {
                if !self.bans.is_banned(channel.id).await {
                    candidate = self
                        .adaptors
                        .get(channel.channel_type)
                        .filter(|a| a.supports_mode(request.mode))
                        .map(|adaptor| Candidate {
                            channel: channel.clone(),
                            adaptor,
                            upstream_model: routing.model.clone(),
                        });
                }
            }
            return candidate.map(|c| vec![c]).ok_or_else(|| {
                RelayError::NoEligibleChannel {
                    model: routing.model.clone(),
                }
            });
        }

        let mut eligible = Vec::new();
        for channel in channels.iter() {
            if !channel.is_enabled() || !channel.serves_model(&request.model) {
                continue;
            }
            if self.bans.is_banned(channel.id).await {
                continue;
            }
            let Some(adaptor) = self.adaptors.get(channel.channel_type) else {
                continue;
            };
            let upstream_model = channel.map_model(&request.model);
            if !adaptor.supports_mode(request.mode) || !adaptor.supports_model(&upstream_model) {
                continue;
            }
            eligible.push(Candidate {
                channel: channel.clone(),
                adaptor,
                upstream_model,
            });
        }

        if eligible.is_empty() {
            return Err(RelayError::NoEligibleChannel {
                model: request.model.clone(),
            });
        }

        let total = eligible.len();
        let mut healthy = Vec::with_capacity(total);
        for candidate in eligible {
            if self.health.is_healthy(candidate.channel.id).await {
                healthy.push(candidate);
            }
        }
        if healthy.is_empty() {
            return Err(RelayError::ChannelsCoolingDown {
                model: request.model.clone(),
                count: total,
            });
        }

        Ok(order_candidates(healthy, &mut rand::thread_rng()))
    }

    async fn complete(
        &self,
        request: &CanonicalRequest,
        ctx: &DispatchContext,
        candidate: &Candidate,
        reply: UpstreamReply,
        started: std::time::Instant,
    ) -> Result<Dispatched, RelayError> {
        let billing = BillingContext {
            request_id: ctx.request_id.clone(),
            model: request.model.clone(),
            upstream_model: candidate.upstream_model.clone(),
            channel_id: candidate.channel.id,
            channel_type: candidate.channel.channel_type,
            overrides: candidate.channel.ratio_overrides.clone(),
            user: ctx.user,
            started,
            resolver: Arc::clone(&self.resolver),
            sink: Arc::clone(&self.usage),
        };

        match reply {
            UpstreamReply::Unary(response) => {
                if request.mode.creates_task() {
                    if let Some(task_id) = &response.task_id {
                        self.bind_task(task_id, request, ctx, candidate).await?;
                    }
                }

                let (usage, estimated) = match response.usage {
                    Some(usage) => (usage, false),
                    None => (
                        Usage::new(
                            request.estimate_prompt_tokens(),
                            estimate_output_tokens(&response.output),
                        ),
                        true,
                    ),
                };
                let breakdown = billing.charge(&usage, estimated, false);
                self.health
                    .record_token_usage(
                        candidate.channel.id,
                        usage.prompt_tokens,
                        usage.completion_tokens,
                    )
                    .await;
                Ok(Dispatched::Complete {
                    response,
                    channel_id: candidate.channel.id,
                    quota: breakdown.quota,
                })
            }
            UpstreamReply::Stream(stream) => {
                let meter = StreamMeter {
                    billing,
                    health: Arc::clone(&self.health),
                    prompt_estimate: request.estimate_prompt_tokens(),
                    usage: None,
                    output_chars: 0,
                    finished: false,
                };
                Ok(Dispatched::Streaming {
                    stream: meter_stream(stream, meter, ctx.deadline, ctx.cancel.clone()),
                    channel_id: candidate.channel.id,
                    upstream_model: candidate.upstream_model.clone(),
                })
            }
        }
    }

    async fn bind_task(
        &self,
        task_id: &str,
        request: &CanonicalRequest,
        ctx: &DispatchContext,
        candidate: &Candidate,
    ) -> Result<(), RelayError> {
        let binding = NewBinding {
            task_id: task_id.to_string(),
            task_type: TaskType::Video,
            user_id: ctx.user.user_id,
            token_id: ctx.user.token_id,
            channel_id: candidate.channel.id,
            channel_type: candidate.channel.channel_type,
            origin_model: request.model.clone(),
            actual_model: candidate.upstream_model.clone(),
        };
        match self.bindings.create(binding).await {
            Ok(_) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    task_id,
                    channel_id = candidate.channel.id,
                    "Bound async task to channel"
                );
                Ok(())
            }
            Err(BindingError::Conflict(id)) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    task_id = %id,
                    channel_id = candidate.channel.id,
                    "Upstream returned a task id that is already bound"
                );
                Err(RelayError::BindingConflict(id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Priority descending, then a weighted shuffle inside each priority.
fn order_candidates<R: Rng + ?Sized>(mut candidates: Vec<Candidate>, rng: &mut R) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.channel.priority.cmp(&a.channel.priority));

    let mut ordered = Vec::with_capacity(candidates.len());
    let mut rest = candidates.into_iter().peekable();
    while let Some(first) = rest.next() {
        let priority = first.channel.priority;
        let mut group = vec![first];
        while let Some(next) = rest.next_if(|c| c.channel.priority == priority) {
            group.push(next);
        }
        while !group.is_empty() {
            let total: u64 = group.iter().map(|c| u64::from(c.channel.weight.max(1))).sum();
            let mut pick = rng.gen_range(0..total);
            let mut index = 0;
            for (i, c) in group.iter().enumerate() {
                let w = u64::from(c.channel.weight.max(1));
                if pick < w {
                    index = i;
                    break;
                }
                pick -= w;
            }
            ordered.push(group.remove(index));
        }
    }
    ordered
}

fn estimate_output_tokens(output: &ResponseOutput) -> u64 {
    match output {
        ResponseOutput::Chat(choices) => choices
            .iter()
            .map(|c| {
                let reasoning = c.message.reasoning_text().map(estimate_tokens).unwrap_or(0);
                estimate_tokens(&c.message.text()) + reasoning
            })
            .sum(),
        ResponseOutput::Text(choices) => choices.iter().map(|c| estimate_tokens(&c.text)).sum(),
        _ => 0,
    }
}

/// Everything needed to price one request and write its usage record.
struct BillingContext {
    request_id: String,
    model: String,
    upstream_model: String,
    channel_id: i64,
    channel_type: ChannelType,
    overrides: RatioOverrides,
    user: RequestUser,
    started: std::time::Instant,
    resolver: Arc<RatioResolver>,
    sink: Arc<dyn UsageSink>,
}

impl BillingContext {
    fn charge(&self, usage: &Usage, estimated: bool, is_stream: bool) -> QuotaBreakdown {
        let breakdown =
            self.resolver
                .quota_for(&self.model, self.channel_type, &self.overrides, usage);
        self.sink.record(UsageRecord {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            upstream_model: self.upstream_model.clone(),
            channel_id: self.channel_id,
            channel_type: self.channel_type,
            user_id: self.user.user_id,
            token_id: self.user.token_id,
            prompt_tokens: usage.prompt_tokens,
            cached_prompt_tokens: usage.cached_prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_quota: breakdown.quota,
            input_ratio: breakdown.input_ratio,
            ratio_source: breakdown.source.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            is_stream,
            estimated,
            created_at: chrono::Utc::now(),
        });
        breakdown
    }
}

/// Tracks a stream's usage and bills it exactly once, at the end of the
/// stream or when the consumer drops it.
struct StreamMeter {
    billing: BillingContext,
    health: SharedChannelHealthTracker,
    prompt_estimate: u64,
    usage: Option<Usage>,
    output_chars: usize,
    finished: bool,
}

impl StreamMeter {
    fn observe(&mut self, chunk: &StreamChunk) {
        self.output_chars += chunk.output_chars();
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let (usage, estimated) = match self.usage {
            Some(usage) if !usage.is_empty() => (usage, false),
            _ => (
                Usage::new(
                    self.prompt_estimate,
                    (self.output_chars as u64).div_ceil(4),
                ),
                true,
            ),
        };
        self.billing.charge(&usage, estimated, true);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let health = Arc::clone(&self.health);
            let channel_id = self.billing.channel_id;
            handle.spawn(async move {
                health
                    .record_token_usage(channel_id, usage.prompt_tokens, usage.completion_tokens)
                    .await;
            });
        }
    }
}

impl Drop for StreamMeter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                request_id = %self.billing.request_id,
                channel_id = self.billing.channel_id,
                "Stream dropped before completion"
            );
        }
        self.finish();
    }
}

enum StreamStep {
    Item(Option<Result<StreamChunk, RelayError>>),
    Cancelled,
    TimedOut,
}

fn meter_stream(
    inner: ChunkStream,
    mut meter: StreamMeter,
    deadline: Instant,
    cancel: CancellationToken,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => StreamStep::Cancelled,
                _ = tokio::time::sleep_until(deadline) => StreamStep::TimedOut,
                next = inner.next() => StreamStep::Item(next),
            };
            match step {
                StreamStep::Item(Some(Ok(chunk))) => {
                    meter.observe(&chunk);
                    yield Ok(chunk);
                }
                StreamStep::Item(Some(Err(e))) => {
                    tracing::warn!(
                        request_id = %meter.billing.request_id,
                        channel_id = meter.billing.channel_id,
                        error = %e,
                        "Upstream stream failed mid-response"
                    );
                    yield Err(e);
                    break;
                }
                StreamStep::Item(None) => break,
                StreamStep::Cancelled => {
                    tracing::info!(request_id = %meter.billing.request_id, "Stream cancelled");
                    break;
                }
                StreamStep::TimedOut => {
                    yield Err(RelayError::timeout());
                    break;
                }
            }
        }
        drop(inner);
        meter.finish();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use rand::SeedableRng;
    use reqwest::header::HeaderMap;

    use crate::adaptor::{StreamParser, UpstreamBody};
    use crate::channel::ChannelStore;
    use crate::channel_health::ChannelHealthTracker;
    use crate::error::{ErrorKind, UnavailableReason};
    use crate::pricing::PricingCatalog;
    use crate::relay::{ChatMessage, RelayMode, Role, VideoJob, VideoRequest};
    use crate::task_binding::{BindingStore, InMemoryBindingStore};
    use crate::usage::MemoryUsageSink;

    #[derive(Clone)]
    enum Outcome {
        Ok,
        Unavailable,
        Rejected,
        Video(&'static str),
        Stream(Vec<StreamChunk>),
        /// Never answers.
        Hang,
        /// Yields the chunks, then stalls without ending.
        StreamThenStall(Vec<StreamChunk>),
    }

    struct ScriptedAdaptor {
        outcomes: HashMap<i64, Outcome>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Adaptor for ScriptedAdaptor {
        fn channel_type(&self) -> ChannelType {
            ChannelType::OpenAI
        }

        fn supports_mode(&self, _mode: RelayMode) -> bool {
            true
        }

        fn request_url(
            &self,
            _target: &UpstreamTarget<'_>,
            _request: &CanonicalRequest,
        ) -> Result<String, RelayError> {
            Ok("http://scripted.invalid".into())
        }

        fn build_request(
            &self,
            _target: &UpstreamTarget<'_>,
            _request: &CanonicalRequest,
        ) -> Result<UpstreamBody, RelayError> {
            Ok(UpstreamBody::Empty)
        }

        fn parse_response(
            &self,
            _target: &UpstreamTarget<'_>,
            _request: &CanonicalRequest,
            _headers: &HeaderMap,
            _body: Bytes,
        ) -> Result<CanonicalResponse, RelayError> {
            Err(RelayError::Parse("unused".into()))
        }

        fn stream_parser(&self, _request: &CanonicalRequest) -> Box<dyn StreamParser> {
            unreachable!()
        }

        async fn invoke(
            &self,
            _client: &reqwest::Client,
            target: &UpstreamTarget<'_>,
            request: &CanonicalRequest,
        ) -> Result<UpstreamReply, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.get(&target.channel.id).cloned().unwrap_or(Outcome::Ok) {
                Outcome::Ok => {
                    let mut response = CanonicalResponse::new(
                        request.model.clone(),
                        ResponseOutput::Chat(vec![crate::relay::ChatChoice {
                            index: 0,
                            message: ChatMessage::new(Role::Assistant, "hi"),
                            finish_reason: Some("stop".into()),
                        }]),
                    );
                    response.usage = Some(Usage::new(10, 5));
                    Ok(UpstreamReply::Unary(response))
                }
                Outcome::Unavailable => Err(RelayError::unavailable(
                    UnavailableReason::ServerError,
                    "boom",
                )),
                Outcome::Rejected => Err(RelayError::UpstreamRejected {
                    status: 400,
                    message: "bad".into(),
                    body: Bytes::from_static(b"{}"),
                }),
                Outcome::Video(id) => {
                    let mut response = CanonicalResponse::new(
                        request.model.clone(),
                        ResponseOutput::Video(VideoJob::queued(id, target.model)),
                    );
                    response.task_id = Some(id.to_string());
                    response.usage = Some(Usage::new(4, 0));
                    Ok(UpstreamReply::Unary(response))
                }
                Outcome::Stream(chunks) => Ok(UpstreamReply::Stream(Box::pin(
                    futures::stream::iter(chunks.into_iter().map(Ok)),
                ))),
                Outcome::Hang => futures::future::pending().await,
                Outcome::StreamThenStall(chunks) => Ok(UpstreamReply::Stream(Box::pin(
                    futures::stream::iter(chunks.into_iter().map(Ok))
                        .chain(futures::stream::pending()),
                ))),
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        calls: Arc<AtomicUsize>,
        usage: Arc<MemoryUsageSink>,
        bindings: Arc<InMemoryBindingStore>,
    }

    fn channel(id: i64, priority: i64) -> Channel {
        let mut c = Channel::new(id, ChannelType::OpenAI, format!("sk-{}", id));
        c.priority = priority;
        c
    }

    fn fixture(channels: Vec<Channel>, outcomes: Vec<(i64, Outcome)>) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut adaptors = AdaptorRegistry::new();
        adaptors.register(Arc::new(ScriptedAdaptor {
            outcomes: outcomes.into_iter().collect(),
            calls: Arc::clone(&calls),
        }));
        let usage = Arc::new(MemoryUsageSink::new());
        let bindings = Arc::new(InMemoryBindingStore::new());
        let dispatcher = Dispatcher::new(
            Arc::new(ChannelStore::from_channels(channels).unwrap()),
            adaptors,
            Arc::new(RatioResolver::new(PricingCatalog::builtin().unwrap())),
            Arc::new(ChannelHealthTracker::new()),
            BanSet::new(),
            bindings.clone(),
            usage.clone(),
            reqwest::Client::new(),
            DispatcherSettings { max_retries: 3 },
        );
        Fixture {
            dispatcher,
            calls,
            usage,
            bindings,
        }
    }

    fn ctx() -> DispatchContext {
        DispatchContext::new(
            "req-test",
            RequestUser {
                user_id: 42,
                token_id: 7,
            },
            Duration::from_secs(30),
        )
    }

    fn chat() -> CanonicalRequest {
        CanonicalRequest::chat("gpt-4o", vec![ChatMessage::new(Role::User, "hello")])
    }

    #[tokio::test]
    async fn no_channels_is_a_configuration_error() {
        let f = fixture(vec![], vec![]);
        let err = f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::Configuration);
        assert_eq!(err.request_id, "req-test");
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn fails_over_past_unavailable_channels() {
        let f = fixture(
            vec![channel(1, 30), channel(2, 20), channel(3, 10)],
            vec![(1, Outcome::Unavailable), (2, Outcome::Unavailable)],
        );
        let result = f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap();
        match result {
            Dispatched::Complete {
                channel_id, quota, ..
            } => {
                assert_eq!(channel_id, 3);
                assert!(quota > 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        // One call per channel; the channel that answered is not retried.
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        let events = f.dispatcher.health().recent_events(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].from_channel_id, 1);
        assert_eq!(events[0].attempt_number, 1);
        assert_eq!(events[1].from_channel_id, 2);
        assert_eq!(events[1].attempt_number, 2);
        assert!(events.iter().all(|e| e.request_id == "req-test"));

        let records = f.usage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel_id, 3);
        assert_eq!(records[0].prompt_tokens, 10);
        assert!(!f.dispatcher.health().is_healthy(1).await);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_fail_over() {
        let f = fixture(
            vec![channel(1, 10), channel(2, 0)],
            vec![(1, Outcome::Rejected)],
        );
        let err = f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::UpstreamRejected);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.dispatcher.health().recent_events(10).await.is_empty());
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn retry_budget_bounds_attempts() {
        let channels: Vec<_> = (1..=6).map(|id| channel(id, 10 - id)).collect();
        let outcomes = (1..=6).map(|id| (id, Outcome::Unavailable)).collect();
        let f = fixture(channels, outcomes);
        let err = f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap_err();
        match err.error {
            RelayError::ChannelsExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cooling_and_banned_channels_are_skipped() {
        let f = fixture(vec![channel(1, 10), channel(2, 0)], vec![]);
        f.dispatcher
            .health()
            .record_failure(1, UnavailableReason::ServerError, None)
            .await;
        f.dispatcher.bans().ban(2, "manual").await;
        let err = f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap_err();
        match err.error {
            RelayError::ChannelsCoolingDown { count, .. } => assert_eq!(count, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pinned_channel_ignores_cooldown() {
        let f = fixture(vec![channel(5, 0), channel(6, 100)], vec![]);
        f.dispatcher
            .health()
            .record_failure(5, UnavailableReason::RateLimit, None)
            .await;
        let request = CanonicalRequest::video_fetch("sora-2", "video_1");
        let ctx = ctx().with_routing(Some(RoutingContext {
            channel_id: 5,
            model: "sora-2".into(),
        }));
        match f.dispatcher.dispatch(&request, &ctx).await.unwrap() {
            Dispatched::Complete { channel_id, .. } => assert_eq!(channel_id, 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn video_creation_binds_task_to_channel() {
        let mut c = channel(5, 0);
        c.model_mapping.insert("sora".into(), "sora-2".into());
        let f = fixture(vec![c], vec![(5, Outcome::Video("video_abc"))]);
        let request = CanonicalRequest::video(
            "sora",
            VideoRequest {
                prompt: "a cat".into(),
                ..VideoRequest::default()
            },
        );
        f.dispatcher.dispatch(&request, &ctx()).await.unwrap();

        let binding = f.bindings.get("video_abc").await.unwrap().unwrap();
        assert_eq!(binding.channel_id, 5);
        assert_eq!(binding.origin_model, "sora");
        assert_eq!(binding.actual_model, "sora-2");
        assert_eq!(binding.user_id, 42);
        assert_eq!(f.usage.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_task_id_fails_the_request() {
        let f = fixture(vec![channel(5, 0)], vec![(5, Outcome::Video("video_dup"))]);
        let request = CanonicalRequest::video("sora-2", VideoRequest::default());
        f.dispatcher.dispatch(&request, &ctx()).await.unwrap();
        let err = f.dispatcher.dispatch(&request, &ctx()).await.unwrap_err();
        assert_eq!(err.error.kind(), ErrorKind::BindingConflict);
        assert_eq!(f.usage.len(), 1);
    }

    #[tokio::test]
    async fn stream_without_usage_is_estimated_once() {
        let chunks = vec![
            StreamChunk::content("abcdefgh"),
            StreamChunk::content("ijkl"),
            StreamChunk::finish("stop"),
        ];
        let f = fixture(vec![channel(1, 0)], vec![(1, Outcome::Stream(chunks))]);
        let mut request = chat();
        request.stream = true;
        let stream = match f.dispatcher.dispatch(&request, &ctx()).await.unwrap() {
            Dispatched::Streaming { stream, .. } => stream,
            other => panic!("unexpected {other:?}"),
        };
        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected.len(), 3);

        let records = f.usage.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].estimated);
        assert!(records[0].is_stream);
        assert_eq!(records[0].completion_tokens, 3);
    }

    #[tokio::test]
    async fn dropped_stream_is_billed_once() {
        let mut last = StreamChunk::finish("stop");
        last.usage = Some(Usage::new(20, 8));
        let chunks = vec![StreamChunk::content("a"), StreamChunk::content("b"), last];
        let f = fixture(vec![channel(1, 0)], vec![(1, Outcome::Stream(chunks))]);
        let mut stream = match f.dispatcher.dispatch(&chat(), &ctx()).await.unwrap() {
            Dispatched::Streaming { stream, .. } => stream,
            other => panic!("unexpected {other:?}"),
        };
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let records = f.usage.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].estimated);
        assert_eq!(records[0].completion_tokens, 1);
    }

    #[test]
    fn ordering_respects_priority_and_keeps_every_channel() {
        let registry = {
            let mut r = AdaptorRegistry::new();
            r.register(Arc::new(crate::adaptor::OpenAiAdaptor::new(ChannelType::OpenAI)));
            r
        };
        let adaptor = registry.get(ChannelType::OpenAI).unwrap();
        let mk = |id: i64, priority: i64, weight: u32| {
            let mut c = channel(id, priority);
            c.weight = weight;
            Candidate {
                channel: c,
                adaptor: adaptor.clone(),
                upstream_model: "gpt-4o".into(),
            }
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let ordered = order_candidates(
                vec![mk(1, 0, 1), mk(2, 5, 3), mk(3, 5, 1), mk(4, 1, 10)],
                &mut rng,
            );
            let ids: Vec<_> = ordered.iter().map(|c| c.channel.id).collect();
            assert_eq!(ids.len(), 4);
            assert!(ids[..2].contains(&2) && ids[..2].contains(&3));
            assert_eq!(&ids[2..], &[4, 1]);
        }
    }

    #[tokio::test]
    async fn expired_deadline_makes_no_upstream_call() {
        let f = fixture(vec![channel(1, 0)], vec![]);
        let ctx = DispatchContext::new("req-late", RequestUser::default(), Duration::ZERO);
        let err = f.dispatcher.dispatch(&chat(), &ctx).await.unwrap_err();
        assert_eq!(err.request_id, "req-late");
        match err.error {
            RelayError::ChannelsExhausted { attempts, last } => {
                assert_eq!(attempts, 0);
                assert_eq!(last.unavailable_reason(), Some(UnavailableReason::Timeout));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn hung_upstream_is_cut_off_at_the_deadline() {
        let f = fixture(
            vec![channel(1, 10), channel(2, 0)],
            vec![(1, Outcome::Hang), (2, Outcome::Hang)],
        );
        let ctx = DispatchContext::new("req-hang", RequestUser::default(), Duration::from_millis(50));
        let err = tokio::time::timeout(Duration::from_secs(5), f.dispatcher.dispatch(&chat(), &ctx))
            .await
            .expect("dispatch must respect its deadline")
            .unwrap_err();
        match err.error {
            RelayError::ChannelsExhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert_eq!(last.unavailable_reason(), Some(UnavailableReason::Timeout));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(!f.dispatcher.health().is_healthy(1).await);
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_is_not_relayed() {
        let f = fixture(vec![channel(1, 0)], vec![]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = f.dispatcher.dispatch(&chat(), &ctx).await.unwrap_err();
        assert!(matches!(err.error, RelayError::Cancelled));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_while_waiting_on_upstream() {
        let f = fixture(vec![channel(1, 0)], vec![(1, Outcome::Hang)]);
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = f.dispatcher.dispatch(&chat(), &ctx).await.unwrap_err();
        assert!(matches!(err.error, RelayError::Cancelled));
        // Cancellation is the caller's doing, not the channel's.
        assert!(f.dispatcher.health().is_healthy(1).await);
        assert!(f.usage.is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_stream_ends_output_and_bills_once() {
        let chunks = vec![StreamChunk::content("abcdef")];
        let f = fixture(vec![channel(1, 0)], vec![(1, Outcome::StreamThenStall(chunks))]);
        let ctx = ctx();
        let mut stream = match f.dispatcher.dispatch(&chat(), &ctx).await.unwrap() {
            Dispatched::Streaming { stream, .. } => stream,
            other => panic!("unexpected {other:?}"),
        };
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta.content.as_deref(), Some("abcdef"));
        assert!(f.usage.is_empty());

        ctx.cancel.cancel();
        assert!(stream.next().await.is_none());

        let records = f.usage.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].estimated);
        assert_eq!(records[0].completion_tokens, 2);

        drop(stream);
        assert_eq!(f.usage.len(), 1);
    }

    #[tokio::test]
    async fn stalled_stream_times_out_and_bills_once() {
        let chunks = vec![StreamChunk::content("abcd")];
        let f = fixture(vec![channel(1, 0)], vec![(1, Outcome::StreamThenStall(chunks))]);
        let ctx = DispatchContext::new("req-stall", RequestUser::default(), Duration::from_millis(100));
        let stream = match f.dispatcher.dispatch(&chat(), &ctx).await.unwrap() {
            Dispatched::Streaming { stream, .. } => stream,
            other => panic!("unexpected {other:?}"),
        };
        let items: Vec<_> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("stream must end at the deadline");
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.unavailable_reason(), Some(UnavailableReason::Timeout));

        let records = f.usage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].completion_tokens, 1);
    }
}
