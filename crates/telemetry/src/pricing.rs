//! Per-model pricing table.
//!
//! Prices are in USD per 1 million tokens, keyed `"<provider>:<model>"`.
//! The table is seeded from registered provider declarations and can be
//! overridden at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or update pricing for a `"provider:model"` key.
    pub fn set(&self, key: impl Into<String>, pricing: ModelPricing) {
        let mut prices = self.prices.write().unwrap_or_else(|e| e.into_inner());
        prices.insert(key.into(), pricing);
    }

    /// Look up pricing for a key. Returns None if not found.
    pub fn get(&self, key: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());
        prices.get(key).copied()
    }

    /// Compute cost for a model call, returning 0.0 when unknown.
    ///
    /// Tries exact `"provider:model"` match first, then falls back to a
    /// bare-model prefix match so versioned upstream ids
    /// (`gpt-4o-mini-2024-07-18`) still price as their base model.
    pub fn compute_cost(&self, key: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let prices = self.prices.read().unwrap_or_else(|e| e.into_inner());

        if let Some(p) = prices.get(key) {
            return p.cost(input_tokens, output_tokens);
        }

        let bare = key.rsplit(':').next().unwrap_or(key).to_lowercase();
        let mut best: Option<(usize, ModelPricing)> = None;
        for (known, pricing) in prices.iter() {
            let known_bare = known.rsplit(':').next().unwrap_or(known).to_lowercase();
            if bare.starts_with(&known_bare)
                && best.map_or(true, |(len, _)| known_bare.len() > len)
            {
                best = Some((known_bare.len(), *pricing));
            }
        }

        best.map(|(_, p)| p.cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.prices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_cost() {
        let table = PricingTable::empty();
        table.set("p_oai:gpt-4o", ModelPricing::new(2.5, 10.0));

        // (1000 * 2.5 + 500 * 10.0) / 1M = 0.0075
        let cost = table.compute_cost("p_oai:gpt-4o", 1000, 500);
        assert!((cost - 0.0075).abs() < 1e-12);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = PricingTable::empty();
        assert_eq!(table.compute_cost("p:mystery", 1000, 1000), 0.0);
    }

    #[test]
    fn versioned_id_matches_base_model() {
        let table = PricingTable::empty();
        table.set("p_oai:gpt-4o", ModelPricing::new(2.5, 10.0));
        table.set("p_oai:gpt-4o-mini", ModelPricing::new(0.15, 0.6));

        // Longest bare-model prefix wins
        let cost = table.compute_cost("p_oai:gpt-4o-mini-2024-07-18", 1_000_000, 0);
        assert!((cost - 0.15).abs() < 1e-12);
    }

    #[test]
    fn set_overrides_existing() {
        let table = PricingTable::empty();
        table.set("p:m", ModelPricing::new(1.0, 2.0));
        table.set("p:m", ModelPricing::new(5.0, 20.0));
        let cost = table.compute_cost("p:m", 1_000_000, 0);
        assert!((cost - 5.0).abs() < 1e-12);
    }
}
