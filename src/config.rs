//! `GatewayConfig`: the variadic option set spec.md §6 describes, assembled
//! through a builder rather than parsed from a CLI — the CLI/server entry
//! point is out of scope here (spec §1). `validate()` mirrors the teacher's
//! `Config::validate()` idiom: descriptive errors, never a panic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::deployment::Deployment;
use crate::executor::{ExecutorConfig, FallbackReporter};
use crate::plugins::Plugin;
use crate::rate_limiter::RateLimiterConfig;
use crate::router::RouterConfig;

#[derive(Clone)]
pub struct GatewayConfig {
    pub deployments: Vec<Deployment>,
    pub router: RouterConfig,
    pub executor: ExecutorConfig,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub cache_ttl: Option<Duration>,
    pub pricing_overlay_path: Option<PathBuf>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub fallback_reporter: Option<Arc<FallbackReporter>>,
    pub default_tenant_scope: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            deployments: Vec::new(),
            router: RouterConfig::default(),
            executor: ExecutorConfig::default(),
            rate_limiter: None,
            cache_ttl: None,
            pricing_overlay_path: None,
            plugins: Vec::new(),
            fallback_reporter: None,
            default_tenant_scope: "default".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.deployments.is_empty() {
            return Err("at least one deployment must be configured".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for deployment in &self.deployments {
            if !seen.insert(&deployment.id) {
                return Err(format!("duplicate deployment id: {}", deployment.id));
            }
            if deployment.base_url.trim().is_empty() {
                return Err(format!("deployment {} has an empty base_url", deployment.id));
            }
        }
        if self.executor.retry_count > 10 {
            return Err("retry_count above 10 is almost certainly a misconfiguration".to_string());
        }
        if self.router.failure_threshold_percent <= 0.0 || self.router.failure_threshold_percent > 1.0 {
            return Err("failure_threshold_percent must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

/// Builder over `GatewayConfig`, mirroring the teacher's `Config`-building
/// style but without CLI/env parsing.
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: GatewayConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deployment(mut self, deployment: Deployment) -> Self {
        self.config.deployments.push(deployment);
        self
    }

    pub fn router(mut self, router: RouterConfig) -> Self {
        self.config.router = router;
        self
    }

    pub fn executor(mut self, executor: ExecutorConfig) -> Self {
        self.config.executor = executor;
        self
    }

    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limiter = Some(config);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = Some(ttl);
        self
    }

    pub fn pricing_overlay_path(mut self, path: PathBuf) -> Self {
        self.config.pricing_overlay_path = Some(path);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.config.plugins.push(plugin);
        self
    }

    pub fn fallback_reporter(mut self, reporter: Arc<FallbackReporter>) -> Self {
        self.config.fallback_reporter = Some(reporter);
        self
    }

    pub fn default_tenant_scope(mut self, scope: impl Into<String>) -> Self {
        self.config.default_tenant_scope = scope.into();
        self
    }

    pub fn build(self) -> Result<GatewayConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
