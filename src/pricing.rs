//! Immutable `(provider, model) -> cost` lookup, loaded from an embedded
//! default table and optionally overlayed from a file.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy)]
pub struct ModelCost {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

/// Sentinel used by the lowest-cost strategy when no registry entry and no
/// per-deployment override exist: high enough to deprioritize unpriced
/// deployments without making them unselectable.
pub const UNKNOWN_MODEL_COST: f64 = 1.0;

/// Small, illustrative embedded table — pricing *data* is explicitly out of
/// scope; only the registry mechanics are load-bearing here.
static DEFAULT_PRICING: Lazy<Vec<(&'static str, &'static str, f64, f64)>> = Lazy::new(|| {
    vec![
        ("openai", "gpt-4o", 0.000005, 0.000015),
        ("openai", "gpt-4o-mini", 0.00000015, 0.0000006),
        ("openai", "gpt-4-turbo", 0.00001, 0.00003),
        ("openai", "gpt-3.5-turbo", 0.0000005, 0.0000015),
        ("azure", "gpt-4o", 0.000005, 0.000015),
        ("bedrock", "anthropic.claude-3-sonnet", 0.000003, 0.000015),
        ("bedrock", "anthropic.claude-3-haiku", 0.00000025, 0.00000125),
    ]
});

#[derive(Debug, Default)]
pub struct PricingRegistry {
    by_provider_model: HashMap<String, ModelCost>,
    by_model: HashMap<String, ModelCost>,
}

impl PricingRegistry {
    /// Build from the embedded defaults only.
    pub fn new() -> Self {
        let mut registry = Self::default();
        for (provider, model, input, output) in DEFAULT_PRICING.iter() {
            registry.insert(provider, model, ModelCost { input_cost_per_token: *input, output_cost_per_token: *output });
        }
        registry
    }

    /// Build from the embedded defaults, then overlay entries from a JSON
    /// file of `[{provider, model, input_cost_per_token, output_cost_per_token}]`.
    /// A load failure is returned to the caller, never panics.
    pub fn with_overlay_file(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let mut registry = Self::new();
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GatewayError::Config(format!("pricing overlay read failed: {e}")))?;
        let entries: Vec<OverlayEntry> = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Config(format!("pricing overlay parse failed: {e}")))?;
        for entry in entries {
            registry.insert(
                &entry.provider,
                &entry.model,
                ModelCost { input_cost_per_token: entry.input_cost_per_token, output_cost_per_token: entry.output_cost_per_token },
            );
        }
        Ok(registry)
    }

    fn insert(&mut self, provider: &str, model: &str, cost: ModelCost) {
        self.by_provider_model.insert(format!("{provider}/{model}"), cost);
        self.by_model.insert(model.to_string(), cost);
    }

    /// Lookup order: `provider/model`, then bare `model`.
    pub fn lookup(&self, provider: &str, model: &str) -> Option<ModelCost> {
        self.by_provider_model
            .get(&format!("{provider}/{model}"))
            .or_else(|| self.by_model.get(model))
            .copied()
    }

    pub fn is_known(&self, provider: &str, model: &str) -> bool {
        self.lookup(provider, model).is_some()
    }
}

#[derive(serde::Deserialize)]
struct OverlayEntry {
    provider: String,
    model: String,
    input_cost_per_token: f64,
    output_cost_per_token: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_prefers_provider_model_over_bare_model() {
        let mut registry = PricingRegistry::new();
        registry.insert("custom", "gpt-4o", ModelCost { input_cost_per_token: 0.5, output_cost_per_token: 0.5 });
        let openai = registry.lookup("openai", "gpt-4o").unwrap();
        assert!(openai.input_cost_per_token < 0.5);
        let custom = registry.lookup("custom", "gpt-4o").unwrap();
        assert_eq!(custom.input_cost_per_token, 0.5);
    }

    #[test]
    fn unknown_model_is_unknown() {
        let registry = PricingRegistry::new();
        assert!(!registry.is_known("nobody", "nothing"));
    }
}
