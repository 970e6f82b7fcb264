//! Per-model price table for cost accounting.
//!
//! Prices are USD per million tokens, split into prompt and completion
//! rates. The table is read-only process-wide state: built once at startup
//! (optionally merged with `LLM_QUEST_PRICES_JSON`) and passed by reference.
//! Lookups are pure.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::Usage;

/// Environment variable holding JSON price overrides:
/// `{"<model>": {"prompt": <usd/mtok>, "completion": <usd/mtok>}}`.
pub const PRICES_ENV: &str = "LLM_QUEST_PRICES_JSON";

/// Prompt/completion rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelPrice {
    pub prompt: f64,
    pub completion: f64,
}

const BUILTIN_PRICES: &[(&str, ModelPrice)] = &[
    (
        "gpt-4o",
        ModelPrice {
            prompt: 2.50,
            completion: 10.00,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPrice {
            prompt: 0.15,
            completion: 0.60,
        },
    ),
    (
        "claude-3-5-sonnet-latest",
        ModelPrice {
            prompt: 3.00,
            completion: 15.00,
        },
    ),
    (
        "claude-3-5-haiku-latest",
        ModelPrice {
            prompt: 0.80,
            completion: 4.00,
        },
    ),
    (
        "gemini-1.5-pro",
        ModelPrice {
            prompt: 1.25,
            completion: 5.00,
        },
    ),
    (
        "gemini-1.5-flash",
        ModelPrice {
            prompt: 0.075,
            completion: 0.30,
        },
    ),
    (
        "deepseek-chat",
        ModelPrice {
            prompt: 0.27,
            completion: 1.10,
        },
    ),
];

/// Immutable model → price mapping.
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    /// Built-in prices only.
    pub fn builtin() -> Self {
        Self {
            prices: BUILTIN_PRICES
                .iter()
                .map(|(model, price)| (model.to_string(), *price))
                .collect(),
        }
    }

    /// Built-in prices merged with `LLM_QUEST_PRICES_JSON` overrides.
    pub fn from_env() -> Result<Self> {
        let mut table = Self::builtin();
        if let Ok(raw) = std::env::var(PRICES_ENV) {
            let overrides: HashMap<String, ModelPrice> =
                serde_json::from_str(&raw).with_context(|| format!("parse {PRICES_ENV}"))?;
            table.prices.extend(overrides);
        }
        Ok(table)
    }

    /// Cost of one call in USD. Unknown models cost 0.0 (the local baseline
    /// and unlisted models are free rather than an error).
    pub fn cost(&self, model: &str, usage: Usage) -> f64 {
        let Some(price) = self.prices.get(model) else {
            return 0.0;
        };
        let prompt = usage.prompt_tokens as f64 * price.prompt / 1_000_000.0;
        let completion = usage.completion_tokens as f64 * price.completion / 1_000_000.0;
        prompt + completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: u64, completion: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn cost_is_pure_lookup() {
        let table = PriceTable::builtin();
        let cost = table.cost("gpt-4o", usage(1_000_000, 1_000_000));
        assert!((cost - 12.50).abs() < 1e-9);
        // Same inputs, same result.
        assert_eq!(cost, table.cost("gpt-4o", usage(1_000_000, 1_000_000)));
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let table = PriceTable::builtin();
        assert_eq!(table.cost("random_local", usage(500, 500)), 0.0);
    }

    #[test]
    fn overrides_replace_builtin_rates() {
        let mut table = PriceTable::builtin();
        table.prices.insert(
            "gpt-4o".to_string(),
            ModelPrice {
                prompt: 1.0,
                completion: 1.0,
            },
        );
        let cost = table.cost("gpt-4o", usage(2_000_000, 0));
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
