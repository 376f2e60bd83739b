//! Model pricing tables and session budget configuration.
//!
//! Rates are expressed in USD per million tokens, looked up by model-id
//! prefix. Unknown models fall back to [`DEFAULT_PRICING`]; the lookup result
//! records which source matched so callers can surface approximate costs as
//! approximate.

use serde::{Deserialize, Serialize};

/// Per-model token rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl ModelPricing {
    #[must_use]
    pub const fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }

    /// Cost in USD for the given token counts.
    #[must_use]
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        prompt_tokens as f64 / 1_000_000.0 * self.prompt_per_million
            + completion_tokens as f64 / 1_000_000.0 * self.completion_per_million
    }
}

/// Fallback rates for models absent from every table.
pub const DEFAULT_PRICING: ModelPricing = ModelPricing::new(1.0, 3.0);

/// Known model-id prefixes and their rates.
///
/// Ordered by specificity (more specific prefixes first) to ensure correct
/// matching when multiple prefixes could match.
const KNOWN_PRICING: &[(&str, ModelPricing)] = &[
    // OpenAI
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4o", ModelPricing::new(2.50, 10.00)),
    ("gpt-4.1-mini", ModelPricing::new(0.40, 1.60)),
    ("gpt-4.1", ModelPricing::new(2.00, 8.00)),
    ("o4-mini", ModelPricing::new(1.10, 4.40)),
    ("o3", ModelPricing::new(2.00, 8.00)),
    // Anthropic
    ("claude-opus-4", ModelPricing::new(15.00, 75.00)),
    ("claude-sonnet-4", ModelPricing::new(3.00, 15.00)),
    ("claude-3-7-sonnet", ModelPricing::new(3.00, 15.00)),
    ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00)),
    // Local models are free
    ("llama", ModelPricing::new(0.0, 0.0)),
    ("qwen", ModelPricing::new(0.0, 0.0)),
    ("mistral", ModelPricing::new(0.0, 0.0)),
];

/// Where a pricing lookup's rates came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingSource {
    /// Exact match from a caller-supplied override.
    Override,
    /// Matched a known prefix (the matched prefix).
    BuiltIn(&'static str),
    /// Fell back to [`DEFAULT_PRICING`] because no table matched.
    DefaultFallback,
}

/// Result of a pricing lookup.
///
/// Makes the "fallback OR real rates" decision explicit at the call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPricing {
    pub pricing: ModelPricing,
    pub source: PricingSource,
}

/// Look up rates for `model`, consulting `overrides` first, then the built-in
/// prefix table, then [`DEFAULT_PRICING`].
#[must_use]
pub fn resolve_pricing(
    model: &str,
    overrides: &[(String, ModelPricing)],
) -> ResolvedPricing {
    if let Some((_, pricing)) = overrides
        .iter()
        .find(|(name, _)| model == name || model.starts_with(name.as_str()))
    {
        return ResolvedPricing {
            pricing: *pricing,
            source: PricingSource::Override,
        };
    }

    if let Some((prefix, pricing)) = KNOWN_PRICING
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
    {
        return ResolvedPricing {
            pricing: *pricing,
            source: PricingSource::BuiltIn(prefix),
        };
    }

    ResolvedPricing {
        pricing: DEFAULT_PRICING,
        source: PricingSource::DefaultFallback,
    }
}

/// Session spend limits.
///
/// Budget checks are observational: crossing a threshold logs a warning and
/// never blocks a call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum spend per session in USD. `None` disables budget warnings.
    pub max_cost_per_session: Option<f64>,
    /// Percentage of the budget at which to emit a soft warning.
    pub warn_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_per_session: None,
            warn_threshold: 80.0,
        }
    }
}
