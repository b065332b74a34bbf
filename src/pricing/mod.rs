//! Ratio-based pricing.
//!
//! Prices are stored as *ratios*: ratio 1 means $0.002 per 1K tokens, which
//! is exactly one quota unit per token at [`QUOTA_PER_USD`]. Per-unit prices
//! (video seconds, whole videos) use the same scale with one "token" per unit.

mod resolver;
mod tables;

pub use resolver::{QuotaBreakdown, Ratio, RatioResolver, RatioSource};

use std::collections::HashMap;

use thiserror::Error;

use crate::channel::ChannelType;

/// Quota units per US dollar.
pub const QUOTA_PER_USD: f64 = 500_000.0;

/// Price used for a model no table knows about.
pub const DEFAULT_MODEL_RATIO: f64 = 30.0;

/// Completion and cached-input multipliers when a table entry has none.
pub const DEFAULT_COMPLETION_RATIO: f64 = 1.0;
pub const DEFAULT_CACHED_INPUT_RATIO: f64 = 1.0;

/// Fixed conversion used for RMB-denominated provider prices.
pub const RMB_PER_USD: f64 = 7.0;

/// Ratio for a price given in USD per million tokens.
pub fn usd_per_million(usd: f64) -> f64 {
    usd / 2.0
}

/// Ratio for a price given in RMB per million tokens.
pub fn rmb_per_million(rmb: f64) -> f64 {
    rmb / RMB_PER_USD / 2.0
}

/// Ratio for a price given in USD per billable unit.
pub fn per_unit_usd(usd: f64) -> f64 {
    usd * QUOTA_PER_USD
}

/// Ratio for a price given in RMB per billable unit.
pub fn per_unit_rmb(rmb: f64) -> f64 {
    rmb / RMB_PER_USD * QUOTA_PER_USD
}

/// Which part of the usage a ratio applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCategory {
    Input,
    Completion,
    CachedInput,
}

#[derive(Debug, Error, PartialEq)]
pub enum PricingError {
    #[error("{table}: model '{model}' has invalid {field} {value}")]
    InvalidRatio {
        table: &'static str,
        model: String,
        field: &'static str,
        value: f64,
    },
    #[error("{table}: model '{model}' tier thresholds must be > 0 and strictly increasing (got {threshold})")]
    InvalidThreshold {
        table: &'static str,
        model: String,
        threshold: u64,
    },
    #[error("{table}: model '{model}' listed twice")]
    DuplicateModel { table: &'static str, model: String },
}

impl From<PricingError> for crate::error::RelayError {
    fn from(e: PricingError) -> Self {
        crate::error::RelayError::Configuration(e.to_string())
    }
}

/// A price step that applies once the request's input tokens reach
/// `input_token_threshold`.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTier {
    pub input_token_threshold: u64,
    pub base_ratio: f64,
    pub completion_ratio: f64,
    pub cached_input_ratio: Option<f64>,
}

/// Static price for one model.
///
/// `completion_ratio` and `cached_input_ratio` are multipliers on the
/// selected tier's `base_ratio`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub base_ratio: f64,
    pub completion_ratio: f64,
    pub cached_input_ratio: Option<f64>,
    pub tiers: Vec<PricingTier>,
}

/// The price step selected for a given input size. Threshold 0 is the
/// entry's own base fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectedTier {
    pub input_token_threshold: u64,
    pub base_ratio: f64,
    pub completion_ratio: f64,
    pub cached_input_ratio: Option<f64>,
}

impl ModelPricing {
    pub fn flat(base_ratio: f64, completion_ratio: f64) -> Self {
        Self {
            base_ratio,
            completion_ratio,
            cached_input_ratio: None,
            tiers: Vec::new(),
        }
    }

    /// Input-only price (speech characters, video units, rerank).
    pub fn input_only(base_ratio: f64) -> Self {
        Self::flat(base_ratio, DEFAULT_COMPLETION_RATIO)
    }

    pub fn cached(mut self, cached_input_ratio: f64) -> Self {
        self.cached_input_ratio = Some(cached_input_ratio);
        self
    }

    pub fn tier(
        mut self,
        input_token_threshold: u64,
        base_ratio: f64,
        completion_ratio: f64,
        cached_input_ratio: Option<f64>,
    ) -> Self {
        self.tiers.push(PricingTier {
            input_token_threshold,
            base_ratio,
            completion_ratio,
            cached_input_ratio,
        });
        self
    }

    /// The entry's own base fields as a tier.
    pub fn base_tier(&self) -> SelectedTier {
        SelectedTier {
            input_token_threshold: 0,
            base_ratio: self.base_ratio,
            completion_ratio: self.completion_ratio,
            cached_input_ratio: self.cached_input_ratio,
        }
    }

    /// Pick the tier with the largest threshold ≤ `input_tokens`.
    pub fn select_tier(&self, input_tokens: u64) -> SelectedTier {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.input_token_threshold <= input_tokens)
            .map(|t| SelectedTier {
                input_token_threshold: t.input_token_threshold,
                base_ratio: t.base_ratio,
                completion_ratio: t.completion_ratio,
                cached_input_ratio: t.cached_input_ratio.or(self.cached_input_ratio),
            })
            .unwrap_or_else(|| self.base_tier())
    }

    fn validate(&self, table: &'static str, model: &str) -> Result<(), PricingError> {
        let check = |field: &'static str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(PricingError::InvalidRatio {
                    table,
                    model: model.to_string(),
                    field,
                    value,
                })
            }
        };
        check("base_ratio", self.base_ratio)?;
        check("completion_ratio", self.completion_ratio)?;
        if let Some(c) = self.cached_input_ratio {
            check("cached_input_ratio", c)?;
        }
        let mut previous = 0u64;
        for tier in &self.tiers {
            if tier.input_token_threshold <= previous {
                return Err(PricingError::InvalidThreshold {
                    table,
                    model: model.to_string(),
                    threshold: tier.input_token_threshold,
                });
            }
            previous = tier.input_token_threshold;
            check("tier base_ratio", tier.base_ratio)?;
            check("tier completion_ratio", tier.completion_ratio)?;
            if let Some(c) = tier.cached_input_ratio {
                check("tier cached_input_ratio", c)?;
            }
        }
        Ok(())
    }
}

/// Validated model → price map for one provider.
#[derive(Debug, Clone)]
pub struct PricingTable {
    entries: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn from_entries(
        name: &'static str,
        entries: Vec<(&str, ModelPricing)>,
    ) -> Result<Self, PricingError> {
        let mut map = HashMap::with_capacity(entries.len());
        for (model, pricing) in entries {
            pricing.validate(name, model)?;
            if map.insert(model.to_string(), pricing).is_some() {
                return Err(PricingError::DuplicateModel {
                    table: name,
                    model: model.to_string(),
                });
            }
        }
        Ok(Self { entries: map })
    }

    pub fn get(&self, normalized_model: &str) -> Option<&ModelPricing> {
        self.entries.get(normalized_model)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Search order for channels that have no table of their own.
const CUSTOM_SEARCH_ORDER: [ChannelType; 6] = [
    ChannelType::OpenAI,
    ChannelType::Anthropic,
    ChannelType::Gemini,
    ChannelType::Groq,
    ChannelType::Zhipu,
    ChannelType::Novita,
];

/// Every provider's pricing table.
#[derive(Debug, Clone)]
pub struct PricingCatalog {
    tables: HashMap<ChannelType, PricingTable>,
}

impl PricingCatalog {
    /// The built-in tables. Fails if any entry is malformed.
    pub fn builtin() -> Result<Self, PricingError> {
        let mut map = HashMap::new();
        map.insert(ChannelType::OpenAI, tables::openai()?);
        map.insert(ChannelType::Anthropic, tables::anthropic()?);
        map.insert(ChannelType::Gemini, tables::gemini()?);
        map.insert(ChannelType::Groq, tables::groq()?);
        map.insert(ChannelType::Zhipu, tables::zhipu()?);
        map.insert(ChannelType::Novita, tables::novita()?);
        Ok(Self { tables: map })
    }

    pub fn from_tables(tables: HashMap<ChannelType, PricingTable>) -> Self {
        Self { tables }
    }

    /// Look up a normalized model for a channel type. Returns the table
    /// that matched along with the price.
    pub fn lookup(
        &self,
        channel_type: ChannelType,
        normalized_model: &str,
    ) -> Option<(ChannelType, &ModelPricing)> {
        if channel_type == ChannelType::Custom {
            return CUSTOM_SEARCH_ORDER.iter().find_map(|t| {
                self.tables
                    .get(t)
                    .and_then(|table| table.get(normalized_model))
                    .map(|p| (*t, p))
            });
        }
        self.tables
            .get(&channel_type)
            .and_then(|table| table.get(normalized_model))
            .map(|p| (channel_type, p))
    }

    pub fn table(&self, channel_type: ChannelType) -> Option<&PricingTable> {
        self.tables.get(&channel_type)
    }
}

const STRIPPED_SUFFIXES: [&str; 2] = ["-internet", "-search"];
const STRIPPED_PREFIXES: [&str; 8] = [
    "openai/",
    "anthropic/",
    "google/",
    "models/",
    "meta-llama/",
    "deepseek/",
    "qwen/",
    "zai-org/",
];

/// Canonical model name used for pricing lookups.
///
/// Strips routing suffixes and vendor prefixes until nothing changes, so
/// `normalize(normalize(m)) == normalize(m)`.
pub fn normalize_model_name(model: &str) -> String {
    let mut current = model.trim();
    loop {
        let before = current;
        for suffix in STRIPPED_SUFFIXES {
            if let Some(stripped) = current.strip_suffix(suffix) {
                current = stripped;
            }
        }
        for prefix in STRIPPED_PREFIXES {
            if let Some(stripped) = current.strip_prefix(prefix) {
                current = stripped;
            }
        }
        if current == before {
            return current.to_string();
        }
    }
}
