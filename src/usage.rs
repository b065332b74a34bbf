//! Usage records: one per completed relay request.

use std::sync::Mutex;

use serde::Serialize;

use crate::channel::ChannelType;
use crate::pricing::RatioSource;

/// Billable outcome of one request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageRecord {
    pub request_id: String,
    /// Model the caller asked for.
    pub model: String,
    /// Model name sent upstream after channel mapping.
    pub upstream_model: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub user_id: i64,
    pub token_id: i64,
    pub prompt_tokens: u64,
    pub cached_prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_quota: i64,
    pub input_ratio: f64,
    pub ratio_source: RatioSource,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    /// Token counts were estimated because the upstream reported none.
    pub estimated: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Destination for usage records. Writes are fire-and-forget.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Logs each record on the `usage` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::info!(
            target: "usage",
            request_id = %record.request_id,
            model = %record.model,
            upstream_model = %record.upstream_model,
            channel_id = record.channel_id,
            channel_type = %record.channel_type,
            user_id = record.user_id,
            token_id = record.token_id,
            prompt_tokens = record.prompt_tokens,
            cached_prompt_tokens = record.cached_prompt_tokens,
            completion_tokens = record.completion_tokens,
            cost_quota = record.cost_quota,
            input_ratio = record.input_ratio,
            elapsed_ms = record.elapsed_ms,
            is_stream = record.is_stream,
            estimated = record.estimated,
            "Usage recorded"
        );
    }
}

/// Keeps records in memory for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageSink for MemoryUsageSink {
    fn record(&self, record: UsageRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> UsageRecord {
        UsageRecord {
            request_id: id.to_string(),
            model: "gpt-4o".into(),
            upstream_model: "gpt-4o".into(),
            channel_id: 1,
            channel_type: ChannelType::OpenAI,
            user_id: 7,
            token_id: 9,
            prompt_tokens: 10,
            cached_prompt_tokens: 0,
            completion_tokens: 5,
            cost_quota: 25,
            input_ratio: 1.25,
            ratio_source: RatioSource::GlobalDefault,
            elapsed_ms: 12,
            is_stream: false,
            estimated: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemoryUsageSink::new();
        assert!(sink.is_empty());
        sink.record(record("a"));
        sink.record(record("b"));
        let ids: Vec<_> = sink.records().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn records_serialize_channel_type_as_id() {
        let v = serde_json::to_value(record("a")).unwrap();
        assert_eq!(v["channel_type"], "openai");
        assert_eq!(v["ratio_source"]["kind"], "global_default");
    }
}
