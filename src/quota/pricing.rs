//! Turn cost estimation.
//!
//! Preference order: the exact cost reported by the agent, then a
//! per-model price table, then a fixed per-turn fallback so accounting
//! degrades to an estimate rather than free usage.

/// Per-million-token prices for a model family.
#[derive(Debug, Clone, Copy)]
struct ModelPrice {
    /// Substring matched against the reported model name.
    family: &'static str,
    input_per_mtok: f64,
    output_per_mtok: f64,
}

const PRICE_TABLE: &[ModelPrice] = &[
    ModelPrice {
        family: "opus",
        input_per_mtok: 15.0,
        output_per_mtok: 75.0,
    },
    ModelPrice {
        family: "sonnet",
        input_per_mtok: 3.0,
        output_per_mtok: 15.0,
    },
    ModelPrice {
        family: "haiku",
        input_per_mtok: 0.80,
        output_per_mtok: 4.0,
    },
];

/// Flat estimate used when neither an exact cost nor token counts are
/// available. Roughly a 1500-token turn at mid-tier pricing.
const FALLBACK_COST_PER_TURN: f64 = 0.02;

/// Token count assumed for a turn with no usage data at all.
pub const FALLBACK_TOKENS_PER_TURN: i64 = 1500;

fn price_for(model: &str) -> Option<ModelPrice> {
    let model = model.to_lowercase();
    PRICE_TABLE
        .iter()
        .find(|price| model.contains(price.family))
        .copied()
}

/// Estimate the cost of one turn in USD.
///
/// An exact reported cost always wins. Otherwise token counts are
/// priced with the model table, falling back to a flat per-turn charge
/// when the model is unknown or no tokens were reported.
pub fn estimate_turn_cost(
    reported_cost: Option<f64>,
    model: Option<&str>,
    input_tokens: i64,
    output_tokens: i64,
) -> f64 {
    if let Some(cost) = reported_cost {
        if cost >= 0.0 {
            return cost;
        }
    }

    if input_tokens > 0 || output_tokens > 0 {
        if let Some(price) = model.and_then(price_for) {
            return (input_tokens as f64 * price.input_per_mtok
                + output_tokens as f64 * price.output_per_mtok)
                / 1_000_000.0;
        }
    }

    FALLBACK_COST_PER_TURN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_cost_wins() {
        let cost = estimate_turn_cost(Some(0.1234), Some("claude-sonnet"), 1000, 1000);
        assert!((cost - 0.1234).abs() < 1e-9);
    }

    #[test]
    fn test_negative_reported_cost_is_rejected() {
        let cost = estimate_turn_cost(Some(-1.0), None, 0, 0);
        assert!((cost - FALLBACK_COST_PER_TURN).abs() < 1e-9);
    }

    #[test]
    fn test_model_table_pricing() {
        // 1M input + 1M output on sonnet pricing.
        let cost = estimate_turn_cost(None, Some("claude-sonnet-4"), 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-6);
    }

    #[test]
    fn test_model_match_is_case_insensitive() {
        let cost = estimate_turn_cost(None, Some("Claude-OPUS-4"), 1_000_000, 0);
        assert!((cost - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let cost = estimate_turn_cost(None, Some("mystery-model"), 500, 500);
        assert!((cost - FALLBACK_COST_PER_TURN).abs() < 1e-9);
    }

    #[test]
    fn test_no_usage_falls_back() {
        let cost = estimate_turn_cost(None, None, 0, 0);
        assert!((cost - FALLBACK_COST_PER_TURN).abs() < 1e-9);
    }
}
