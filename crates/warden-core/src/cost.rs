use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use warden_llm::Usage;

use crate::config::CostConfig;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k_usd: f64,
    pub output_per_1k_usd: f64,
    #[serde(default)]
    pub cache_read_per_1k_usd: f64,
}

impl ModelPricing {
    #[must_use]
    pub const fn new(input_per_1k_usd: f64, output_per_1k_usd: f64) -> Self {
        Self {
            input_per_1k_usd,
            output_per_1k_usd,
            cache_read_per_1k_usd: 0.0,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn cost(&self, usage: &Usage) -> f64 {
        self.input_per_1k_usd * (usage.input_tokens as f64) / 1000.0
            + self.output_per_1k_usd * (usage.output_tokens as f64) / 1000.0
            + self.cache_read_per_1k_usd * (usage.cache_read_tokens as f64) / 1000.0
    }
}

fn default_pricing() -> HashMap<String, ModelPricing> {
    let mut m = HashMap::new();
    m.insert("gpt-4o".into(), ModelPricing::new(0.0025, 0.01));
    m.insert("gpt-4o-mini".into(), ModelPricing::new(0.000_15, 0.0006));
    m.insert("claude-sonnet-4".into(), ModelPricing::new(0.003, 0.015));
    m.insert("claude-opus-4".into(), ModelPricing::new(0.015, 0.075));
    m
}

/// Per-agent cumulative spend. Models missing from the price table cost nothing.
#[derive(Debug)]
pub struct CostTracker {
    pricing: HashMap<String, ModelPricing>,
    spent: Mutex<HashMap<String, f64>>,
    enabled: bool,
}

impl CostTracker {
    #[must_use]
    pub fn new(config: &CostConfig) -> Self {
        let mut pricing = default_pricing();
        pricing.extend(config.pricing.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            pricing,
            spent: Mutex::new(HashMap::new()),
            enabled: config.enabled,
        }
    }

    #[must_use]
    pub fn with_pricing(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.to_owned(), pricing);
        self
    }

    /// Price `usage` on `model`, add it to the agent's running total and
    /// return the cost of this call.
    pub fn record(&self, agent_id: &str, model: &str, usage: &Usage) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let cost = self.pricing.get(model).map_or(0.0, |p| p.cost(usage));
        let mut spent = self.spent.lock().unwrap_or_else(PoisonError::into_inner);
        *spent.entry(agent_id.to_owned()).or_insert(0.0) += cost;
        cost
    }

    #[must_use]
    pub fn spent(&self, agent_id: &str) -> f64 {
        self.spent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .copied()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            ..Usage::default()
        }
    }

    #[test]
    fn records_usage_per_agent() {
        let tracker = CostTracker::new(&CostConfig::default());
        let cost = tracker.record("ops", "gpt-4o", &usage(1000, 1000));
        assert!((cost - 0.0125).abs() < 1e-9);
        tracker.record("ops", "gpt-4o", &usage(1000, 0));
        assert!((tracker.spent("ops") - 0.015).abs() < 1e-9);
        assert!(tracker.spent("research").abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_model_zero_cost() {
        let tracker = CostTracker::new(&CostConfig::default());
        assert!(tracker.record("ops", "local-llama", &usage(5000, 5000)).abs() < f64::EPSILON);
        assert!(tracker.spent("ops").abs() < f64::EPSILON);
    }

    #[test]
    fn configured_pricing_overrides_builtin() {
        let mut config = CostConfig::default();
        config
            .pricing
            .insert("gpt-4o".into(), ModelPricing::new(1.0, 0.0));
        let tracker = CostTracker::new(&config);
        assert!((tracker.record("a", "gpt-4o", &usage(2000, 50)) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_tracker_records_nothing() {
        let config = CostConfig {
            enabled: false,
            ..CostConfig::default()
        };
        let tracker = CostTracker::new(&config).with_pricing("m", ModelPricing::new(1.0, 1.0));
        assert!(tracker.record("a", "m", &usage(1000, 1000)).abs() < f64::EPSILON);
        assert!(tracker.spent("a").abs() < f64::EPSILON);
    }
}
