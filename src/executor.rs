//! Request Executor: the non-streaming path. Rate-limit check, pricing
//! check, pick, sanitize, build/execute, retry with backoff and fallback,
//! usage estimation, cache store, plugin hooks — in that order (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::adapters::AdapterRegistry;
use crate::cache::{chat_cache_key, CacheManager};
use crate::deployment::Deployment;
use crate::error::{GatewayError, LlmError};
use crate::pricing::PricingRegistry;
use crate::rate_limiter::{self, RateLimiter, RateLimiterConfig, RequestLimitContext};
use crate::router::{RequestContext, Router};
use crate::schemas::{ChatRequest, ChatResponse, Usage};
use crate::tokenizer;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub retry_count: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_factor: f64,
    pub fallback_enabled: bool,
    pub request_timeout: Duration,
    pub enforce_pricing: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_count: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
            jitter_factor: 0.1,
            fallback_enabled: true,
            request_timeout: Duration::from_secs(30),
            enforce_pricing: true,
        }
    }
}

/// `min(base * 2^(attempt-1) + jitter*rand, max)`, grounded in the teacher's
/// `calculate_backoff`.
pub fn backoff_duration(attempt: u32, config: &ExecutorConfig) -> Duration {
    let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
    let base = config.backoff_base_ms.saturating_mul(exp);
    let jitter = (base as f64 * config.jitter_factor * fastrand::f64()) as u64;
    Duration::from_millis(base.saturating_add(jitter).min(config.backoff_max_ms))
}

pub type FallbackReporter = dyn Fn(&str, &str, &GatewayError, bool) + Send + Sync;

pub struct RequestExecutor {
    pub router: Arc<Router>,
    pub adapters: Arc<AdapterRegistry>,
    pub pricing: Arc<PricingRegistry>,
    pub http: reqwest::Client,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub rate_limiter_config: RateLimiterConfig,
    pub cache: Option<Arc<CacheManager>>,
    pub config: ExecutorConfig,
    pub fallback_reporter: Option<Arc<FallbackReporter>>,
}

pub struct ExecContext<'a> {
    pub tenant_scope: &'a str,
    pub api_key: Option<&'a str>,
}

impl RequestExecutor {
    pub async fn execute(&self, request: ChatRequest, ctx: &ExecContext<'_>) -> Result<ChatResponse, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;

        let estimated_prompt_tokens = tokenizer::estimate_prompt_tokens(&request);

        if let Some(limiter) = &self.rate_limiter {
            let limit_ctx = RequestLimitContext { request: &request, api_key: ctx.api_key, estimated_prompt_tokens };
            let descriptors = rate_limiter::default_descriptors(&self.rate_limiter_config, &limit_ctx);
            let allowed = rate_limiter::evaluate(limiter.as_ref(), &descriptors, self.rate_limiter_config.failure_mode).await?;
            if !allowed {
                return Err(GatewayError::RateLimited(format!("rate limit exceeded for model {}", request.model)));
            }
        }

        let (provider_hint, _) = split_provider_model(&request.model);
        if self.config.enforce_pricing {
            self.check_pricing(provider_hint, &request.model)?;
        }

        if let Some(cache) = &self.cache {
            if !request.stream.unwrap_or(false) {
                let key = chat_cache_key(ctx.tenant_scope, &request);
                if let Some(cached) = cache.get(&key) {
                    if let Ok(response) = serde_json::from_str::<ChatResponse>(&cached) {
                        debug!(model = %request.model, "cache hit");
                        return Ok(response);
                    }
                }
            }
        }

        let router_ctx = RequestContext {
            model: request.model.clone(),
            is_streaming: false,
            tags: request.tags.clone(),
            estimated_input_tokens: estimated_prompt_tokens,
        };

        let original_model = request.model.clone();
        let mut last_error: Option<GatewayError> = None;
        let mut deployment = self.router.pick_with_context(&router_ctx).await?;

        for attempt in 1..=(self.config.retry_count + 1) {
            let is_single = self.router.is_single_deployment(&original_model);
            match self.try_once(&deployment, &request).await {
                Ok(response) => {
                    if let Some(reporter) = &self.fallback_reporter {
                        if attempt > 1 {
                            if let Some(err) = &last_error {
                                reporter(&original_model, &deployment.model, err, true);
                            }
                        }
                    }
                    if let Some(cache) = &self.cache {
                        if !request.stream.unwrap_or(false) {
                            let key = chat_cache_key(ctx.tenant_scope, &request);
                            if let Ok(body) = serde_json::to_string(&response) {
                                cache.set(key, body);
                            }
                        }
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let retryable = err.retryable();
                    last_error = Some(match &err {
                        GatewayError::Upstream(e) => GatewayError::Upstream(e.clone()),
                        other => GatewayError::Internal(other.to_string()),
                    });
                    if !retryable || attempt > self.config.retry_count {
                        if let Some(reporter) = &self.fallback_reporter {
                            reporter(&original_model, &deployment.model, last_error.as_ref().unwrap(), false);
                        }
                        return Err(err);
                    }
                    warn!(deployment = %deployment.id, attempt, "retrying after failure");
                    tokio::time::sleep(backoff_duration(attempt, &self.config)).await;
                    if self.config.fallback_enabled {
                        deployment = self.router.pick_with_context(&router_ctx).await.unwrap_or(deployment);
                    }
                    let _ = is_single;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Internal("retry budget exhausted".into())))
    }

    async fn try_once(&self, deployment: &Deployment, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let adapter = self
            .adapters
            .get(&deployment.provider)
            .ok_or_else(|| GatewayError::Config(format!("no adapter registered for provider type {}", deployment.provider)))?;

        let sanitized = request.sanitized(&deployment.model);

        self.router.report_request_start(&deployment.id).await?;
        let start = std::time::Instant::now();

        let result = async {
            let builder = adapter.build_request(&self.http, deployment, &sanitized)?;
            let response = builder.timeout(self.config.request_timeout).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            adapter.parse_response(deployment, status, &body)
        }
        .await;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let is_single = self.router.is_single_deployment(&request.model);

        match result {
            Ok(mut response) => {
                let tokens = fill_usage(&mut response, request);
                self.router
                    .report_success(&deployment.id, crate::stats::SuccessMetrics { latency_ms, ttft_ms: None, tokens })
                    .await?;
                self.router.report_request_end(&deployment.id).await?;
                Ok(response)
            }
            Err(err) => {
                let llm_err = to_llm_error(&err, deployment);
                self.router.report_failure(&deployment.id, &llm_err, is_single).await?;
                self.router.report_request_end(&deployment.id).await?;
                error!(deployment = %deployment.id, status = llm_err.status, "request failed");
                Err(GatewayError::Upstream(llm_err))
            }
        }
    }

    fn check_pricing(&self, provider_hint: Option<&str>, model: &str) -> Result<(), GatewayError> {
        let provider = provider_hint.unwrap_or("");
        if provider_hint.is_some() && self.pricing.is_known(provider, model) {
            return Ok(());
        }
        if provider_hint.is_none() {
            // Without an explicit provider prefix we cannot assert anything
            // stronger than "some provider has pricing for this model";
            // deployments still resolve to a concrete provider at pick time.
            return Ok(());
        }
        Err(GatewayError::PricingUnknown { provider: provider.to_string(), model: model.to_string() })
    }
}

fn split_provider_model(model: &str) -> (Option<&str>, &str) {
    match model.split_once('/') {
        Some((provider, rest)) => (Some(provider), rest),
        None => (None, model),
    }
}

fn fill_usage(response: &mut ChatResponse, request: &ChatRequest) -> u32 {
    match &mut response.usage {
        Some(usage) if usage.total > 0 || usage.prompt > 0 || usage.completion > 0 => {
            usage.provider = true;
            usage.total
        }
        _ => {
            let prompt = tokenizer::estimate_prompt_tokens(request);
            let completion: u32 = response
                .choices
                .iter()
                .map(|c| tokenizer::estimate_tokens(c.message.content.as_str().unwrap_or_default()))
                .sum();
            let usage = Usage { prompt, completion, total: prompt + completion, provider: false };
            let total = usage.total;
            response.usage = Some(usage);
            total
        }
    }
}

fn to_llm_error(err: &GatewayError, deployment: &Deployment) -> LlmError {
    match err {
        GatewayError::Upstream(e) => e.clone(),
        GatewayError::Transport(msg) => LlmError::new(crate::error::LlmErrorKind::ServiceUnavailable, &deployment.provider, &deployment.model, msg.clone()),
        other => LlmError::new(crate::error::LlmErrorKind::Internal, &deployment.provider, &deployment.model, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_is_capped() {
        let config = ExecutorConfig { backoff_base_ms: 100, backoff_max_ms: 1000, jitter_factor: 0.0, ..Default::default() };
        assert!(backoff_duration(1, &config).as_millis() >= 100);
        assert!(backoff_duration(5, &config).as_millis() <= 1000);
    }

    #[test]
    fn split_provider_model_separates_the_prefix() {
        assert_eq!(split_provider_model("openai/gpt-4o"), (Some("openai"), "gpt-4o"));
        assert_eq!(split_provider_model("gpt-4o"), (None, "gpt-4o"));
    }
}
