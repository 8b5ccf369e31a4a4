//! `Deployment`: a single concrete endpoint serving one model on one
//! provider — the unit of routing and cooldown.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type DeploymentId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub provider: String,
    pub model: String,
    pub alias: Option<String>,
    pub base_url: String,
    /// Static bearer/api-key token. A dynamic token source is out of this
    /// crate's scope (spec.md §1 out-of-scope adapter bodies); callers needing
    /// rotating credentials supply a fresh `Deployment` via `remove`+`add`.
    pub credential: Option<String>,
    pub priority: i32,
    pub tags: Vec<String>,
    pub weight: f64,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u32>,
    pub input_cost_per_token: Option<f64>,
    pub output_cost_per_token: Option<f64>,
    #[serde(default)]
    pub allow_private_base_url: bool,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            model: model.into(),
            alias: None,
            base_url: base_url.into(),
            credential: None,
            priority: 0,
            tags: Vec::new(),
            weight: 1.0,
            rpm_limit: None,
            tpm_limit: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
            allow_private_base_url: false,
            extra_headers: HashMap::new(),
        }
    }

    pub fn with_credential(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(token.into());
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_limits(mut self, rpm: Option<u32>, tpm: Option<u32>) -> Self {
        self.rpm_limit = rpm;
        self.tpm_limit = tpm;
        self
    }

    pub fn with_cost(mut self, input: f64, output: f64) -> Self {
        self.input_cost_per_token = Some(input);
        self.output_cost_per_token = Some(output);
        self
    }

    /// The composite key a request naming `provider/model` resolves by.
    pub fn composite_key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
