//! Per-token prices for the models the passes are configured with.
//!
//! Prices are nanodollars (1e-9 USD) per token. Lookup ignores the vendor
//! prefix so "google/gemini-2.5-pro" and "gemini-2.5-pro" price the same.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        i64::from(input_tokens) * self.input_nanos_per_token
            + i64::from(output_tokens) * self.output_nanos_per_token
    }
}

const PRICES: &[(&str, ModelPricing)] = &[
    // $0.30 / $2.50 per 1M
    ("gemini-2.5-flash", ModelPricing::new(300, 2_500)),
    // $1.25 / $10.00 per 1M, <=200k context
    ("gemini-2.5-pro", ModelPricing::new(1_250, 10_000)),
    ("gemini-2.0-flash-001", ModelPricing::new(100, 400)),
    ("gpt-4o-mini", ModelPricing::new(150, 600)),
    ("gpt-4o", ModelPricing::new(2_500, 10_000)),
];

/// Unknown models are priced like the estimator's flat $5 per 1M.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(5_000, 5_000);

pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let bare = model_id.rsplit('/').next().unwrap_or(model_id);
    PRICES.iter().find(|(name, _)| *name == bare).map(|(_, p)| *p)
}

pub fn chat_cost(model_id: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    get_pricing(model_id)
        .unwrap_or(DEFAULT_PRICING)
        .cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_cost() {
        // 1000 * 300 + 1000 * 2500
        assert_eq!(chat_cost("google/gemini-2.5-flash", 1_000, 1_000), 2_800_000);
        assert_eq!(chat_cost("gemini-2.5-flash", 1_000, 1_000), 2_800_000);
    }

    #[test]
    fn vendor_prefix_does_not_confuse_similar_names() {
        assert_eq!(get_pricing("openai/gpt-4o").map(|p| p.input_nanos_per_token), Some(2_500));
        assert_eq!(get_pricing("openai/gpt-4o-mini").map(|p| p.input_nanos_per_token), Some(150));
    }

    #[test]
    fn unknown_models_use_flat_default() {
        assert_eq!(chat_cost("acme/unknown", 1_000, 0), 5_000_000);
    }
}
