//! Deployment registration, health/tag/limit filtering, strategy-specific
//! selection, and the cooldown/circuit-breaker policy. Reports request
//! lifecycle events into the Stats Store as it goes.

pub mod strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::deployment::{Deployment, DeploymentId};
use crate::error::{GatewayError, LlmError};
use crate::pricing::PricingRegistry;
use crate::stats::{current_minute, FailureOpts, StatsStore, SuccessMetrics};

pub use strategy::Strategy;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: Strategy,
    pub cooldown_period_ms: i64,
    pub latency_buffer: f64,
    pub failure_threshold_percent: f64,
    pub min_requests_for_threshold: u64,
    pub immediate_cooldown_on_429: bool,
    pub ewma_alpha: f64,
    pub enable_tag_filtering: bool,
    pub default_provider: Option<String>,
    /// High-volume escape hatch for single-deployment 429s (spec §4.5):
    /// rate-based cooldown still applies, just at a much higher bar.
    pub single_deployment_failure_threshold: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::SimpleShuffle,
            cooldown_period_ms: 60_000,
            latency_buffer: 0.2,
            failure_threshold_percent: 0.5,
            min_requests_for_threshold: 5,
            immediate_cooldown_on_429: true,
            ewma_alpha: 0.1,
            enable_tag_filtering: false,
            default_provider: None,
            single_deployment_failure_threshold: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub model: String,
    pub is_streaming: bool,
    pub tags: Vec<String>,
    pub estimated_input_tokens: u32,
}

pub struct Router {
    config: RouterConfig,
    deployments: RwLock<HashMap<DeploymentId, Deployment>>,
    /// Keyed by both the bare model name and the `provider/model` composite.
    by_model: RwLock<HashMap<String, Vec<DeploymentId>>>,
    stats: Arc<dyn StatsStore>,
    pricing: Arc<PricingRegistry>,
    round_robin_counters: DashMap<String, AtomicU64>,
    rng: strategy::Rng,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl Router {
    pub fn new(config: RouterConfig, stats: Arc<dyn StatsStore>, pricing: Arc<PricingRegistry>) -> Self {
        Self {
            config,
            deployments: RwLock::new(HashMap::new()),
            by_model: RwLock::new(HashMap::new()),
            stats,
            pricing,
            round_robin_counters: DashMap::new(),
            rng: strategy::Rng::new(),
        }
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        let model_key = deployment.model.clone();
        let composite_key = deployment.composite_key();
        let id = deployment.id.clone();
        self.deployments.write().unwrap().insert(id.clone(), deployment);
        let mut by_model = self.by_model.write().unwrap();
        by_model.entry(model_key).or_default().push(id.clone());
        by_model.entry(composite_key).or_default().push(id);
    }

    pub fn remove_deployment(&self, id: &DeploymentId) {
        let removed = self.deployments.write().unwrap().remove(id);
        if let Some(deployment) = removed {
            let mut by_model = self.by_model.write().unwrap();
            for key in [deployment.model.clone(), deployment.composite_key()] {
                if let Some(list) = by_model.get_mut(&key) {
                    list.retain(|existing| existing != id);
                }
            }
        }
    }

    pub fn get_deployment(&self, id: &DeploymentId) -> Option<Deployment> {
        self.deployments.read().unwrap().get(id).cloned()
    }

    pub fn list_providers(&self) -> Vec<Deployment> {
        self.deployments.read().unwrap().values().cloned().collect()
    }

    /// Step 1 of the selection pipeline: resolve `model` against the direct
    /// key, else strip a `provider/` prefix and retry.
    fn candidate_ids(&self, model: &str) -> (Vec<DeploymentId>, String) {
        let by_model = self.by_model.read().unwrap();
        if let Some(ids) = by_model.get(model) {
            if !ids.is_empty() {
                return (ids.clone(), model.to_string());
            }
        }
        if let Some((_, bare)) = model.split_once('/') {
            if let Some(ids) = by_model.get(bare) {
                if !ids.is_empty() {
                    return (ids.clone(), bare.to_string());
                }
            }
        }
        (Vec::new(), model.to_string())
    }

    pub async fn pick(&self, model: &str) -> Result<Deployment, GatewayError> {
        self.pick_with_context(&RequestContext { model: model.to_string(), ..Default::default() }).await
    }

    pub async fn pick_with_context(&self, ctx: &RequestContext) -> Result<Deployment, GatewayError> {
        let (ids, resolved_model) = self.candidate_ids(&ctx.model);
        if ids.is_empty() {
            return Err(GatewayError::NoDeployments(ctx.model.clone()));
        }

        let deployments: Vec<Deployment> = {
            let guard = self.deployments.read().unwrap();
            ids.iter().filter_map(|id| guard.get(id).cloned()).collect()
        };

        let mut stats_by_id = HashMap::new();
        for deployment in &deployments {
            if let Some(stats) = self.stats.get_stats(&deployment.id).await? {
                stats_by_id.insert(deployment.id.clone(), stats);
            } else {
                stats_by_id.insert(deployment.id.clone(), crate::stats::DeploymentStats::new());
            }
        }

        let now = now_ms();
        let now_minute = current_minute(now);

        // Step 3: drop cooling-down deployments.
        let mut survivors: Vec<&Deployment> = deployments.iter().filter(|d| !stats_by_id[&d.id].is_circuit_open(now)).collect();

        // Step 4: tag filtering.
        if self.config.enable_tag_filtering {
            if !ctx.tags.is_empty() {
                let matching: Vec<&Deployment> = survivors.iter().copied().filter(|d| d.tags.iter().any(|t| ctx.tags.contains(t))).collect();
                survivors = if !matching.is_empty() {
                    matching
                } else {
                    let defaults: Vec<&Deployment> = survivors.iter().copied().filter(|d| d.has_tag("default")).collect();
                    if defaults.is_empty() {
                        return Err(GatewayError::NoDeploymentsWithTag(ctx.model.clone()));
                    }
                    defaults
                };
            } else {
                let defaults: Vec<&Deployment> = survivors.iter().copied().filter(|d| d.has_tag("default")).collect();
                if !defaults.is_empty() {
                    survivors = defaults;
                }
            }
        }

        // Step 5: TPM/RPM admission.
        if ctx.estimated_input_tokens > 0 {
            survivors.retain(|d| {
                let stats = &stats_by_id[&d.id];
                let tpm_ok = d.tpm_limit.map(|l| stats.tpm.current(now_minute) + ctx.estimated_input_tokens as u64 <= l as u64).unwrap_or(true);
                let rpm_ok = d.rpm_limit.map(|l| stats.rpm.current(now_minute) + 1 <= l as u64).unwrap_or(true);
                tpm_ok && rpm_ok
            });
        }

        if survivors.is_empty() {
            return Err(GatewayError::NoDeployments(ctx.model.clone()));
        }

        // Step 6: prefer the configured default provider if any survive.
        if let Some(default_provider) = &self.config.default_provider {
            let preferred: Vec<&Deployment> = survivors.iter().copied().filter(|d| &d.provider == default_provider).collect();
            if !preferred.is_empty() {
                survivors = preferred;
            }
        }

        let candidates: Vec<strategy::Candidate> =
            survivors.iter().map(|d| strategy::Candidate { deployment: d, stats: &stats_by_id[&d.id] }).collect();

        let chosen = match self.config.strategy {
            Strategy::SimpleShuffle | Strategy::TagBased => strategy::weighted_random(&candidates, &self.rng),
            Strategy::RoundRobin => {
                let counter = self.round_robin_counters.entry(resolved_model.clone()).or_insert_with(|| AtomicU64::new(0));
                let value = counter.fetch_add(1, Ordering::Relaxed);
                strategy::round_robin(candidates.len(), value)
            }
            Strategy::LowestLatency => strategy::lowest_latency(&candidates, ctx.is_streaming, self.config.latency_buffer, &self.rng),
            Strategy::LeastBusy => strategy::least_busy(&candidates, &self.rng),
            Strategy::LowestTpmRpm => strategy::lowest_tpm_rpm(&candidates, ctx.estimated_input_tokens, now_minute),
            Strategy::LowestCost => strategy::lowest_cost(&candidates, &self.pricing, &self.rng),
        };

        match chosen {
            Some(idx) => Ok(survivors[idx].clone()),
            None => Err(GatewayError::NoDeployments(ctx.model.clone())),
        }
    }

    pub async fn report_request_start(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.stats.increment_active_requests(id).await
    }

    pub async fn report_request_end(&self, id: &DeploymentId) -> Result<(), GatewayError> {
        self.stats.decrement_active_requests(id).await
    }

    pub async fn report_success(&self, id: &DeploymentId, metrics: SuccessMetrics) -> Result<(), GatewayError> {
        self.stats.record_success(id, metrics).await
    }

    /// Record the failure and apply the cooldown policy in one step, mirroring
    /// `recordFailure`'s responsibility in spec §4.4.
    pub async fn report_failure(&self, id: &DeploymentId, err: &LlmError, is_single_deployment: bool) -> Result<(), GatewayError> {
        self.stats.record_failure(id, FailureOpts { is_single_deployment, status: err.status }).await?;
        self.apply_cooldown_policy(id, err, is_single_deployment).await
    }

    async fn apply_cooldown_policy(&self, id: &DeploymentId, err: &LlmError, is_single_deployment: bool) -> Result<(), GatewayError> {
        let now = now_ms();
        let immediate = matches!(err.status, 401 | 404 | 408);
        let immediate_429 = err.status == 429 && self.config.immediate_cooldown_on_429 && !is_single_deployment;

        if immediate || immediate_429 {
            warn!(deployment = %id, status = err.status, "cooling down deployment immediately");
            return self.set_cooldown(id, now + self.config.cooldown_period_ms).await;
        }

        let Some(stats) = self.stats.get_stats(id).await? else { return Ok(()) };
        let now_minute = current_minute(now);
        let (successes, failures) = stats.sliding_window_totals(now_minute);
        let total = successes + failures;

        let threshold = if is_single_deployment { self.config.single_deployment_failure_threshold } else { self.config.min_requests_for_threshold };

        if total >= threshold && failures as f64 / total.max(1) as f64 > self.config.failure_threshold_percent {
            debug!(deployment = %id, failures, total, "sliding-window failure threshold exceeded");
            return self.set_cooldown(id, now + self.config.cooldown_period_ms).await;
        }

        Ok(())
    }

    pub async fn set_cooldown(&self, id: &DeploymentId, until_ms: i64) -> Result<(), GatewayError> {
        self.stats.set_cooldown(id, until_ms).await
    }

    pub async fn is_circuit_open(&self, id: &DeploymentId) -> Result<bool, GatewayError> {
        let until = self.stats.get_cooldown_until(id).await?;
        Ok(until > now_ms())
    }

    pub fn stats(&self) -> Arc<dyn StatsStore> {
        self.stats.clone()
    }

    /// True when exactly one deployment currently exists for `model`
    /// (by either key), used by the 429 single-deployment carve-out.
    pub fn is_single_deployment(&self, model: &str) -> bool {
        self.candidate_ids(model).0.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::memory::InMemoryStatsStore;

    fn router(strategy: Strategy) -> Router {
        let config = RouterConfig { strategy, ..Default::default() };
        Router::new(config, Arc::new(InMemoryStatsStore::new()), Arc::new(PricingRegistry::new()))
    }

    #[tokio::test]
    async fn pick_resolves_via_bare_model_after_composite_miss() {
        let router = router(Strategy::SimpleShuffle);
        router.add_deployment(Deployment::new("dep-1", "openai", "gpt-4o", "https://api.openai.com"));
        let picked = router.pick("gpt-4o").await.unwrap();
        assert_eq!(picked.id, "dep-1");
        let picked = router.pick("openai/gpt-4o").await.unwrap();
        assert_eq!(picked.id, "dep-1");
    }

    #[tokio::test]
    async fn no_deployments_for_unknown_model_errors() {
        let router = router(Strategy::SimpleShuffle);
        let err = router.pick("nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoDeployments(_)));
    }

    #[tokio::test]
    async fn cooldown_excludes_a_deployment_until_it_expires() {
        let router = router(Strategy::SimpleShuffle);
        router.add_deployment(Deployment::new("dep-1", "openai", "gpt-4o", "https://api.openai.com"));
        router.set_cooldown(&"dep-1".to_string(), now_ms() + 60_000).await.unwrap();
        assert!(router.pick("gpt-4o").await.is_err());
    }

    #[tokio::test]
    async fn single_deployment_429_does_not_cool_down() {
        let router = router(Strategy::SimpleShuffle);
        router.add_deployment(Deployment::new("dep-1", "openai", "gpt-4o", "https://api.openai.com"));
        let err = LlmError::new(crate::error::LlmErrorKind::RateLimit, "openai", "gpt-4o", "rate limited");
        let single = router.is_single_deployment("gpt-4o");
        router.report_failure(&"dep-1".to_string(), &err, single).await.unwrap();
        assert!(!router.is_circuit_open(&"dep-1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn round_robin_cycles_through_candidates() {
        let router = router(Strategy::RoundRobin);
        router.add_deployment(Deployment::new("dep-1", "openai", "gpt-4o", "https://api.openai.com"));
        router.add_deployment(Deployment::new("dep-2", "openai", "gpt-4o", "https://api.openai.com"));
        let first = router.pick("gpt-4o").await.unwrap().id;
        let second = router.pick("gpt-4o").await.unwrap().id;
        assert_ne!(first, second);
        let third = router.pick("gpt-4o").await.unwrap().id;
        assert_eq!(first, third);
    }
}
