//! The Public Client: the single entry point wiring together the Router,
//! Adapter Registry, Pricing Registry, Stats Store, optional Rate Limiter,
//! optional response Cache, and Plugin Pipeline behind one shared
//! `reqwest::Client`. Grounded in the teacher's `AppState` construction
//! (one shared HTTP client, one adapter, built once at startup) generalized
//! from "one fixed backend" to "many deployments behind a Router".

use std::sync::Arc;

#[cfg(feature = "streaming")]
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::AdapterRegistry;
use crate::cache::CacheManager;
use crate::config::GatewayConfig;
use crate::core::http_client::HttpClientBuilder;
use crate::deployment::{Deployment, DeploymentId};
use crate::error::GatewayError;
use crate::executor::{ExecContext, RequestExecutor};
use crate::plugins::{PluginPipeline, PreHookResult};
use crate::pricing::PricingRegistry;
use crate::rate_limiter::{InMemoryRateLimiter, RateLimiter, RateLimiterConfig};
use crate::router::Router;
use crate::schemas::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, ListModelsResponse, ModelInfo, StreamChunk};
use crate::stats::memory::InMemoryStatsStore;
use crate::stats::StatsStore;

/// The gateway's entry point. Cheap to clone (every field is an `Arc`), so
/// callers can share one instance across tasks the way the teacher shares
/// one `AppState`.
#[derive(Clone)]
pub struct Client {
    router: Arc<Router>,
    adapters: Arc<AdapterRegistry>,
    pricing: Arc<PricingRegistry>,
    http: reqwest::Client,
    executor: Arc<RequestExecutor>,
    #[cfg(feature = "streaming")]
    streaming: Arc<crate::streaming::StreamingEngine>,
    plugins: Arc<PluginPipeline>,
    default_tenant_scope: String,
}

impl Client {
    /// Build a client from a validated `GatewayConfig`. Fails only on
    /// configuration problems (empty deployment list, malformed pricing
    /// overlay, an adapter-rejecting base url) — never touches the network.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate().map_err(GatewayError::Config)?;

        let pricing = Arc::new(match &config.pricing_overlay_path {
            Some(path) => PricingRegistry::with_overlay_file(path)?,
            None => PricingRegistry::new(),
        });

        let stats: Arc<dyn StatsStore> = Arc::new(InMemoryStatsStore::with_alpha(config.router.ewma_alpha));
        let router = Arc::new(Router::new(config.router.clone(), stats, pricing.clone()));
        for deployment in &config.deployments {
            crate::adapters::validate_base_url(deployment)?;
            router.add_deployment(deployment.clone());
        }

        let adapters = Arc::new(AdapterRegistry::new());

        let http = HttpClientBuilder::from_executor_config(&config.executor)
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let rate_limiter: Option<Arc<dyn RateLimiter>> = config.rate_limiter.as_ref().map(|_| Arc::new(InMemoryRateLimiter::new()) as Arc<dyn RateLimiter>);
        let rate_limiter_config = config.rate_limiter.clone().unwrap_or_default();
        let cache = config.cache_ttl.map(|ttl| Arc::new(CacheManager::new(ttl)));

        let executor = Arc::new(RequestExecutor {
            router: router.clone(),
            adapters: adapters.clone(),
            pricing: pricing.clone(),
            http: http.clone(),
            rate_limiter,
            rate_limiter_config,
            cache,
            config: config.executor.clone(),
            fallback_reporter: config.fallback_reporter.clone(),
        });

        #[cfg(feature = "streaming")]
        let streaming = Arc::new(crate::streaming::StreamingEngine {
            router: router.clone(),
            adapters: adapters.clone(),
            http: http.clone(),
            config: config.executor.clone(),
        });

        let plugins = Arc::new(PluginPipeline::new(config.plugins.clone()));

        Ok(Self {
            router,
            adapters,
            pricing,
            http,
            executor,
            #[cfg(feature = "streaming")]
            streaming,
            plugins,
            default_tenant_scope: config.default_tenant_scope,
        })
    }

    fn exec_ctx<'a>(&'a self, tenant_scope: Option<&'a str>, api_key: Option<&'a str>) -> ExecContext<'a> {
        ExecContext { tenant_scope: tenant_scope.unwrap_or(&self.default_tenant_scope), api_key }
    }

    /// Non-streaming chat completion, running the request through the plugin
    /// pipeline around the executor (spec §4.9).
    pub async fn chat_completion(&self, request: ChatRequest, tenant_scope: Option<&str>, api_key: Option<&str>) -> Result<ChatResponse, GatewayError> {
        let ctx = self.exec_ctx(tenant_scope, api_key);

        let (request, ran) = if self.plugins.is_empty() {
            (request, 0)
        } else {
            match self.plugins.run_pre_hooks(request).await? {
                (PreHookResult::Request(req), ran) => (req, ran),
                (PreHookResult::ShortCircuit(sc), ran) => {
                    let (response, _) = self.plugins.run_post_hooks(ran, Some(sc.response), None).await;
                    return response.ok_or_else(|| GatewayError::Internal("plugin short-circuit produced no response".into()));
                }
            }
        };

        let result = self.executor.execute(request, &ctx).await;

        if self.plugins.is_empty() {
            return result;
        }
        match result {
            Ok(response) => {
                let (response, error) = self.plugins.run_post_hooks(ran, Some(response), None).await;
                match error {
                    Some(err) => Err(err),
                    None => response.ok_or_else(|| GatewayError::Internal("post-hook dropped the response".into())),
                }
            }
            Err(err) => {
                let (_, error) = self.plugins.run_post_hooks(ran, None, Some(err)).await;
                Err(error.unwrap_or_else(|| GatewayError::Internal("post-hook swallowed an error".into())))
            }
        }
    }

    /// Streaming chat completion. Returns a `Stream` of normalized chunks;
    /// mid-stream recovery happens transparently inside (spec §4.8).
    /// Dropping the returned stream cancels the background task.
    #[cfg(feature = "streaming")]
    pub async fn chat_completion_stream(&self, mut request: ChatRequest) -> Result<impl futures_util::Stream<Item = Result<StreamChunk, GatewayError>>, GatewayError> {
        request.stream = Some(true);
        let cancel = CancellationToken::new();
        let rx = self.streaming.start(request, cancel).await?;
        Ok(rx)
    }

    pub async fn embedding(&self, request: EmbeddingRequest, tenant_scope: Option<&str>) -> Result<EmbeddingResponse, GatewayError> {
        let _ = tenant_scope;
        let deployment = self.router.pick(&request.model).await?;
        let adapter = self
            .adapters
            .get(&deployment.provider)
            .ok_or_else(|| GatewayError::Config(format!("no adapter registered for provider type {}", deployment.provider)))?;
        if !adapter.supports_embedding() {
            return Err(GatewayError::InvalidRequest(format!("{} does not support embeddings", adapter.name())));
        }
        let mut native = request.clone();
        native.model = deployment.model.clone();
        let builder = adapter.build_embedding_request(&self.http, &deployment, &native)?;
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(deployment = %deployment.id, status, "embedding response received");
        adapter.parse_embedding_response(&deployment, status, &body)
    }

    pub fn list_models(&self) -> ListModelsResponse {
        let mut by_model: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
        for deployment in self.router.list_providers() {
            by_model.entry(deployment.model.clone()).or_default().push(deployment.id.clone());
        }
        let data = by_model
            .into_iter()
            .map(|(model, deployments)| ModelInfo { id: model, owned_by: "llmux".to_string(), deployments })
            .collect();
        ListModelsResponse { data }
    }

    pub fn add_deployment(&self, deployment: Deployment) -> Result<(), GatewayError> {
        crate::adapters::validate_base_url(&deployment)?;
        self.router.add_deployment(deployment);
        Ok(())
    }

    pub fn remove_deployment(&self, id: &DeploymentId) {
        self.router.remove_deployment(id);
    }

    pub fn get_providers(&self) -> Vec<Deployment> {
        self.router.list_providers()
    }

    pub fn stats(&self) -> Arc<dyn StatsStore> {
        self.router.stats()
    }

    /// Register a custom provider type after construction (spec §4.1
    /// "polymorphic providers"). Deployments naming `provider_type` going
    /// forward resolve to `adapter`.
    pub fn register_provider_factory(&self, provider_type: &str, adapter: Arc<dyn crate::adapters::Adapter>) {
        self.adapters.register(provider_type, adapter);
    }

    /// Release any held resources (e.g. a distributed stats backend's
    /// connection pool). The in-memory default has nothing to release.
    pub async fn close(&self) -> Result<(), GatewayError> {
        self.router.stats().close().await
    }
}
