//! Built-in per-provider prices.
//!
//! Keys are normalized model names. Video entries bill per second (OpenAI)
//! or per generated video (Zhipu); speech bills per input character.

use super::{
    per_unit_rmb, per_unit_usd, rmb_per_million, usd_per_million, ModelPricing, PricingError,
    PricingTable,
};

pub(super) fn openai() -> Result<PricingTable, PricingError> {
    PricingTable::from_entries(
        "openai",
        vec![
            ("gpt-4o", ModelPricing::flat(usd_per_million(2.5), 4.0).cached(0.5)),
            ("gpt-4o-mini", ModelPricing::flat(usd_per_million(0.15), 4.0).cached(0.5)),
            ("gpt-4.1", ModelPricing::flat(usd_per_million(2.0), 4.0).cached(0.25)),
            ("gpt-4.1-mini", ModelPricing::flat(usd_per_million(0.4), 4.0).cached(0.25)),
            ("gpt-4.1-nano", ModelPricing::flat(usd_per_million(0.1), 4.0).cached(0.25)),
            ("gpt-5", ModelPricing::flat(usd_per_million(1.25), 8.0).cached(0.1)),
            ("gpt-5-mini", ModelPricing::flat(usd_per_million(0.25), 8.0).cached(0.1)),
            ("gpt-5-nano", ModelPricing::flat(usd_per_million(0.05), 8.0).cached(0.1)),
            ("o3", ModelPricing::flat(usd_per_million(2.0), 4.0).cached(0.25)),
            ("o4-mini", ModelPricing::flat(usd_per_million(1.1), 4.0).cached(0.25)),
            ("gpt-3.5-turbo", ModelPricing::flat(usd_per_million(0.5), 3.0)),
            ("gpt-3.5-turbo-instruct", ModelPricing::flat(usd_per_million(1.5), 4.0 / 3.0)),
            // per input character
            ("tts-1", ModelPricing::input_only(usd_per_million(15.0))),
            ("tts-1-hd", ModelPricing::input_only(usd_per_million(30.0))),
            // per second of generated video
            ("sora-2", ModelPricing::input_only(per_unit_usd(0.10))),
            ("sora-2-pro", ModelPricing::input_only(per_unit_usd(0.30))),
        ],
    )
}

pub(super) fn anthropic() -> Result<PricingTable, PricingError> {
    // Long-context (> 200K input) requests are billed at the higher tier for
    // the whole request.
    let sonnet = ModelPricing::flat(usd_per_million(3.0), 5.0)
        .cached(0.1)
        .tier(200_000, usd_per_million(6.0), 3.75, Some(0.1));
    let opus = ModelPricing::flat(usd_per_million(15.0), 5.0).cached(0.1);
    PricingTable::from_entries(
        "anthropic",
        vec![
            ("claude-sonnet-4-5", sonnet.clone()),
            ("claude-sonnet-4-5-20250929", sonnet.clone()),
            ("claude-sonnet-4", sonnet.clone()),
            ("claude-sonnet-4-20250514", sonnet),
            ("claude-3-7-sonnet", ModelPricing::flat(usd_per_million(3.0), 5.0).cached(0.1)),
            ("claude-opus-4-1", opus.clone()),
            ("claude-opus-4-1-20250805", opus.clone()),
            ("claude-opus-4", opus),
            ("claude-haiku-4-5", ModelPricing::flat(usd_per_million(1.0), 5.0).cached(0.1)),
            ("claude-3-5-haiku", ModelPricing::flat(usd_per_million(0.8), 5.0).cached(0.1)),
            ("claude-3-5-haiku-20241022", ModelPricing::flat(usd_per_million(0.8), 5.0).cached(0.1)),
        ],
    )
}

pub(super) fn gemini() -> Result<PricingTable, PricingError> {
    PricingTable::from_entries(
        "gemini",
        vec![
            (
                "gemini-2.5-pro",
                ModelPricing::flat(usd_per_million(1.25), 8.0)
                    .cached(0.25)
                    .tier(200_000, usd_per_million(2.5), 6.0, Some(0.25)),
            ),
            ("gemini-2.5-flash", ModelPricing::flat(usd_per_million(0.3), 2.5 / 0.3).cached(0.25)),
            ("gemini-2.5-flash-lite", ModelPricing::flat(usd_per_million(0.1), 4.0).cached(0.25)),
            ("gemini-2.0-flash", ModelPricing::flat(usd_per_million(0.1), 4.0).cached(0.25)),
            (
                "gemini-3-pro-preview",
                ModelPricing::flat(usd_per_million(2.0), 6.0)
                    .cached(0.1)
                    .tier(200_000, usd_per_million(4.0), 4.5, Some(0.1)),
            ),
            ("gemini-1.5-pro", ModelPricing::flat(usd_per_million(1.25), 4.0)),
            ("gemini-1.5-flash", ModelPricing::flat(usd_per_million(0.075), 4.0)),
        ],
    )
}

pub(super) fn groq() -> Result<PricingTable, PricingError> {
    PricingTable::from_entries(
        "groq",
        vec![
            ("llama-3.3-70b-versatile", ModelPricing::flat(usd_per_million(0.59), 0.79 / 0.59)),
            ("llama-3.1-8b-instant", ModelPricing::flat(usd_per_million(0.05), 1.6)),
            ("gpt-oss-120b", ModelPricing::flat(usd_per_million(0.15), 5.0)),
            ("gpt-oss-20b", ModelPricing::flat(usd_per_million(0.075), 4.0)),
            ("qwen3-32b", ModelPricing::flat(usd_per_million(0.29), 0.59 / 0.29)),
            ("moonshotai/kimi-k2-instruct", ModelPricing::flat(usd_per_million(1.0), 3.0)),
        ],
    )
}

pub(super) fn zhipu() -> Result<PricingTable, PricingError> {
    // Inputs above 32K tokens move the GLM-4.5/4.6 family to the higher tier.
    let glm = ModelPricing::flat(rmb_per_million(2.0), 4.0)
        .cached(0.2)
        .tier(32_000, rmb_per_million(4.0), 4.0, Some(0.2));
    PricingTable::from_entries(
        "zhipu",
        vec![
            ("glm-4.6", glm.clone()),
            ("glm-4.5", glm),
            ("glm-4.5-air", ModelPricing::flat(rmb_per_million(0.8), 2.5).cached(0.2)),
            ("glm-4-plus", ModelPricing::flat(rmb_per_million(5.0), 1.0)),
            ("glm-4-flash", ModelPricing::flat(0.0, 1.0)),
            // per generated video
            ("cogvideox-3", ModelPricing::input_only(per_unit_rmb(1.0))),
            ("cogvideox-flash", ModelPricing::input_only(0.0)),
            ("rerank", ModelPricing::input_only(rmb_per_million(0.8))),
            ("chatglm_turbo", ModelPricing::flat(rmb_per_million(5.0), 1.0)),
            ("chatglm_pro", ModelPricing::flat(rmb_per_million(10.0), 1.0)),
            ("chatglm_std", ModelPricing::flat(rmb_per_million(5.0), 1.0)),
            ("chatglm_lite", ModelPricing::flat(rmb_per_million(2.0), 1.0)),
        ],
    )
}

pub(super) fn novita() -> Result<PricingTable, PricingError> {
    PricingTable::from_entries(
        "novita",
        vec![
            ("deepseek-r1", ModelPricing::flat(usd_per_million(0.7), 2.5 / 0.7)),
            ("deepseek-v3", ModelPricing::flat(usd_per_million(0.28), 1.14 / 0.28)),
            ("llama-3.3-70b-instruct", ModelPricing::flat(usd_per_million(0.13), 3.0)),
            ("llama-3.1-8b-instruct", ModelPricing::flat(usd_per_million(0.02), 2.5)),
            ("qwen-2.5-72b-instruct", ModelPricing::flat(usd_per_million(0.38), 0.4 / 0.38)),
        ],
    )
}
