//! Model pricing for session cost recomputation
//!
//! Rates are configuration, not code: the built-in table covers the models
//! commonly seen in transcripts and `settings.json` can override or extend
//! it per model. A transcript's own `result.total_cost_usd` always wins over
//! the recomputation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD per million tokens, by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input,
            output,
            cache_write,
            cache_read,
        }
    }
}

/// Rate table with per-model overrides layered over the defaults.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    overrides: HashMap<String, ModelRates>,
}

impl RateTable {
    pub fn with_overrides(overrides: HashMap<String, [f64; 4]>) -> Self {
        let overrides = overrides
            .into_iter()
            .map(|(model, [i, o, w, r])| (model, ModelRates::new(i, o, w, r)))
            .collect();
        Self { overrides }
    }

    /// Look up rates for a model, normalizing away date suffixes.
    pub fn rates_for(&self, model: &str) -> ModelRates {
        let normalized = normalize_model_name(model);
        if let Some(rates) = self
            .overrides
            .get(model)
            .or_else(|| self.overrides.get(&normalized))
        {
            return *rates;
        }
        default_rates(&normalized)
    }

    /// Cost in USD for one usage record of a given model.
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let rates = self.rates_for(model);
        per_million(usage.input_tokens, rates.input)
            + per_million(usage.output_tokens, rates.output)
            + per_million(usage.cache_creation_tokens, rates.cache_write)
            + per_million(usage.cache_read_tokens, rates.cache_read)
    }
}

/// Accumulated token counts for one model within a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

fn per_million(tokens: u64, rate: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * rate
}

fn default_rates(normalized: &str) -> ModelRates {
    match normalized {
        // Synthetic infrastructure records carry zero usage; never charge.
        "<synthetic>" => ModelRates::new(0.0, 0.0, 0.0, 0.0),
        "claude-sonnet-4-5" | "claude-3-5-sonnet" => ModelRates::new(3.0, 15.0, 3.75, 0.30),
        "claude-haiku-4-5" | "claude-3-5-haiku" => ModelRates::new(1.0, 5.0, 1.25, 0.10),
        "claude-opus-4" | "claude-opus-4-1" => ModelRates::new(15.0, 75.0, 18.75, 1.50),
        _ => {
            tracing::debug!("No rate entry for model {}, using sonnet rates", normalized);
            ModelRates::new(3.0, 15.0, 3.75, 0.30)
        }
    }
}

/// Strip an 8-digit date suffix from a model name.
///
/// `claude-sonnet-4-5-20250929` → `claude-sonnet-4-5`; names without a date
/// suffix pass through unchanged.
pub fn normalize_model_name(model: &str) -> String {
    let parts: Vec<&str> = model.split('-').collect();
    if parts.len() >= 3 {
        if let Some(last) = parts.last() {
            if last.len() == 8 && last.chars().all(|c| c.is_ascii_digit()) {
                return parts[..parts.len() - 1].join("-");
            }
        }
    }
    model.to_string()
}
