//! Three-layer ratio resolution: channel override, provider table, default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::{
    normalize_model_name, PricingCatalog, SelectedTier, TokenCategory,
    DEFAULT_CACHED_INPUT_RATIO, DEFAULT_COMPLETION_RATIO, DEFAULT_MODEL_RATIO,
};
use crate::channel::{ChannelType, RatioOverrides};
use crate::relay::Usage;

/// Where a resolved price came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RatioSource {
    ChannelOverride { key: String },
    AdaptorTable {
        table: ChannelType,
        tier_threshold: u64,
    },
    GlobalDefault,
}

/// A resolved per-token price in ratio units.
///
/// For completion and cached-input categories `value` is a multiplier on
/// the resolved input ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ratio {
    pub value: f64,
    pub source: RatioSource,
}

/// Cost computation for one request, kept for logs and usage records.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaBreakdown {
    pub model: String,
    pub input_ratio: f64,
    pub completion_ratio: f64,
    pub cached_input_ratio: f64,
    pub source: RatioSource,
    pub quota: i64,
}

struct ResolvedRates {
    input: Ratio,
    completion: Ratio,
    cached: Ratio,
}

/// Resolves prices for (model, channel) pairs. Never fails.
#[derive(Debug)]
pub struct RatioResolver {
    catalog: PricingCatalog,
    fallback_hits: AtomicU64,
}

impl RatioResolver {
    pub fn new(catalog: PricingCatalog) -> Self {
        Self {
            catalog,
            fallback_hits: AtomicU64::new(0),
        }
    }

    /// Number of resolutions that fell through to [`DEFAULT_MODEL_RATIO`].
    pub fn fallback_count(&self) -> u64 {
        self.fallback_hits.load(Ordering::Relaxed)
    }

    /// Resolve one price category for a model on a channel.
    pub fn resolve_ratio(
        &self,
        model: &str,
        channel_type: ChannelType,
        overrides: &RatioOverrides,
        category: TokenCategory,
        input_tokens: u64,
    ) -> Ratio {
        let rates = self.resolve_rates(model, channel_type, overrides, input_tokens);
        match category {
            TokenCategory::Input => rates.input,
            TokenCategory::Completion => rates.completion,
            TokenCategory::CachedInput => rates.cached,
        }
    }

    /// Quota owed for `usage` of `model` on a channel.
    ///
    /// `ceil(uncached × in + cached × in × cached_mult + completion × in × comp_mult)`,
    /// never 0 when there was usage at a positive price.
    pub fn quota_for(
        &self,
        model: &str,
        channel_type: ChannelType,
        overrides: &RatioOverrides,
        usage: &Usage,
    ) -> QuotaBreakdown {
        let rates = self.resolve_rates(model, channel_type, overrides, usage.prompt_tokens);
        let input = rates.input.value;
        let completion = input * rates.completion.value;
        let cached = input * rates.cached.value;

        let cached_tokens = usage.cached_prompt_tokens.min(usage.prompt_tokens);
        let uncached_tokens = usage.prompt_tokens - cached_tokens;
        let raw = uncached_tokens as f64 * input
            + cached_tokens as f64 * cached
            + usage.completion_tokens as f64 * completion;

        let mut quota = raw.ceil() as i64;
        let has_usage = usage.prompt_tokens > 0 || usage.completion_tokens > 0;
        if quota == 0 && has_usage && input > 0.0 {
            quota = 1;
        }

        QuotaBreakdown {
            model: normalize_model_name(model),
            input_ratio: input,
            completion_ratio: completion,
            cached_input_ratio: cached,
            source: rates.input.source,
            quota,
        }
    }

    fn resolve_rates(
        &self,
        model: &str,
        channel_type: ChannelType,
        overrides: &RatioOverrides,
        input_tokens: u64,
    ) -> ResolvedRates {
        let normalized = normalize_model_name(model);
        let keys = override_keys(&normalized, channel_type);
        let table_hit = self.catalog.lookup(channel_type, &normalized);

        let base_override = find_override(&overrides.model_ratio, &keys);
        // An overridden base price is flat, so multipliers come from the
        // entry's own fields rather than a tier.
        let tier: Option<(ChannelType, SelectedTier)> = table_hit.map(|(table, p)| {
            let tier = if base_override.is_some() {
                p.base_tier()
            } else {
                p.select_tier(input_tokens)
            };
            (table, tier)
        });
        let table_source = |table: ChannelType, tier: &SelectedTier| RatioSource::AdaptorTable {
            table,
            tier_threshold: tier.input_token_threshold,
        };

        let input = match (&base_override, &tier) {
            (Some((key, value)), _) => Ratio {
                value: *value,
                source: RatioSource::ChannelOverride { key: key.clone() },
            },
            (None, Some((table, tier))) => Ratio {
                value: tier.base_ratio,
                source: table_source(*table, tier),
            },
            (None, None) => {
                self.fallback_hits.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    model = %normalized,
                    channel_type = %channel_type,
                    ratio = DEFAULT_MODEL_RATIO,
                    "No price for model, using default ratio"
                );
                Ratio {
                    value: DEFAULT_MODEL_RATIO,
                    source: RatioSource::GlobalDefault,
                }
            }
        };

        let multiplier = |map: &HashMap<String, f64>,
                          from_tier: fn(&SelectedTier) -> Option<f64>,
                          default: f64| {
            if let Some((key, value)) = find_override(map, &keys) {
                return Ratio {
                    value,
                    source: RatioSource::ChannelOverride { key },
                };
            }
            match &tier {
                Some((table, t)) => Ratio {
                    value: from_tier(t).unwrap_or(default),
                    source: table_source(*table, t),
                },
                None => Ratio {
                    value: default,
                    source: RatioSource::GlobalDefault,
                },
            }
        };
        let completion = multiplier(
            &overrides.completion_ratio,
            |t| Some(t.completion_ratio),
            DEFAULT_COMPLETION_RATIO,
        );
        let cached = multiplier(
            &overrides.cached_input_ratio,
            |t| t.cached_input_ratio,
            DEFAULT_CACHED_INPUT_RATIO,
        );

        ResolvedRates {
            input,
            completion,
            cached,
        }
    }
}

/// Override keys in priority order: composite before bare.
fn override_keys(normalized: &str, channel_type: ChannelType) -> Vec<String> {
    vec![
        format!("{}({})", normalized, channel_type.id()),
        normalized.to_string(),
    ]
}

/// An override key with its model part normalized, so `"openai/gpt-4o(openai)"`
/// and `"gpt-4o(openai)"` name the same price.
fn normalize_override_key(key: &str) -> String {
    let key = key.trim();
    match key.strip_suffix(')').and_then(|k| k.rsplit_once('(')) {
        Some((model, channel_type)) => {
            format!("{}({})", normalize_model_name(model), channel_type.trim())
        }
        None => normalize_model_name(key),
    }
}

/// First key with a matching override. When several spellings normalize to
/// the same key the lexically smallest one wins.
fn find_override(map: &HashMap<String, f64>, keys: &[String]) -> Option<(String, f64)> {
    keys.iter()
        .find_map(|wanted| {
            map.iter()
                .filter(|(k, _)| normalize_override_key(k) == *wanted)
                .min_by(|a, b| a.0.cmp(b.0))
                .map(|(k, v)| (k.clone(), *v))
        })
        .filter(|(_, v)| v.is_finite() && *v >= 0.0)
}
