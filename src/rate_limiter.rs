//! Pre-request rate limiting over a sliding minute window, generalized from
//! the teacher's per-user token-bucket (`rate_limiting.rs`) into the
//! descriptor-list shape: a flat list of `{kind, key, limit, increment,
//! window}` checks evaluated atomically per request.

use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::schemas::ChatRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Requests,
    Tokens,
}

#[derive(Debug, Clone)]
pub struct RateLimitDescriptor {
    pub kind: DescriptorKind,
    pub key: String,
    pub limit: u64,
    pub increment: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub current: u64,
    pub remaining: u64,
    pub reset_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    ByApiKey,
    ByUser,
    ByModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub key_strategy: KeyStrategy,
    pub requests_per_minute: Option<u64>,
    pub tokens_per_minute: Option<u64>,
    pub failure_mode: FailureMode,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { key_strategy: KeyStrategy::ByApiKey, requests_per_minute: None, tokens_per_minute: None, failure_mode: FailureMode::FailOpen }
    }
}

pub struct RequestLimitContext<'a> {
    pub request: &'a ChatRequest,
    pub api_key: Option<&'a str>,
    pub estimated_prompt_tokens: u32,
}

fn extract_key(strategy: KeyStrategy, ctx: &RequestLimitContext) -> String {
    match strategy {
        KeyStrategy::ByApiKey => ctx.api_key.unwrap_or("default").to_string(),
        KeyStrategy::ByUser => ctx.request.user.clone().unwrap_or_else(|| "default".to_string()),
        KeyStrategy::ByModel => ctx.request.model.clone(),
    }
}

/// Builds the descriptor list the gateway always supplies: a `requests`
/// descriptor (increment 1) and, when a TPM limit is configured, a `tokens`
/// descriptor whose increment is the estimated prompt tokens.
pub fn default_descriptors(config: &RateLimiterConfig, ctx: &RequestLimitContext) -> Vec<RateLimitDescriptor> {
    let key = extract_key(config.key_strategy, ctx);
    let mut descriptors = Vec::new();
    if let Some(rpm) = config.requests_per_minute {
        descriptors.push(RateLimitDescriptor { kind: DescriptorKind::Requests, key: key.clone(), limit: rpm, increment: 1, window: Duration::from_secs(60) });
    }
    if let Some(tpm) = config.tokens_per_minute {
        descriptors.push(RateLimitDescriptor {
            kind: DescriptorKind::Tokens,
            key,
            limit: tpm,
            increment: ctx.estimated_prompt_tokens as u64,
            window: Duration::from_secs(60),
        });
    }
    descriptors
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, descriptors: &[RateLimitDescriptor]) -> Result<Vec<RateLimitResult>, GatewayError>;
}

struct WindowState {
    window_start_ms: i64,
    count: u64,
}

pub struct InMemoryRateLimiter {
    windows: DashMap<(DescriptorKind, String), Mutex<WindowState>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self { windows: DashMap::new() }
    }
}

impl Default for InMemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[async_trait::async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(&self, descriptors: &[RateLimitDescriptor]) -> Result<Vec<RateLimitResult>, GatewayError> {
        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let now = now_ms();
            let window_ms = descriptor.window.as_millis() as i64;
            let entry = self.windows.entry((descriptor.kind, descriptor.key.clone())).or_insert_with(|| Mutex::new(WindowState { window_start_ms: now, count: 0 }));
            let mut state = entry.lock().unwrap();
            if now - state.window_start_ms >= window_ms {
                state.window_start_ms = now;
                state.count = 0;
            }
            let projected = state.count + descriptor.increment;
            let allowed = projected <= descriptor.limit;
            if allowed {
                state.count = projected;
            }
            results.push(RateLimitResult {
                allowed,
                current: state.count,
                remaining: descriptor.limit.saturating_sub(state.count),
                reset_at_ms: state.window_start_ms + window_ms,
            });
        }
        Ok(results)
    }
}

/// Evaluate all descriptors; deny the request if any is denied. Infrastructure
/// errors are handled per `failure_mode`.
pub async fn evaluate(limiter: &dyn RateLimiter, descriptors: &[RateLimitDescriptor], failure_mode: FailureMode) -> Result<bool, GatewayError> {
    match limiter.check(descriptors).await {
        Ok(results) => Ok(results.iter().all(|r| r.allowed)),
        Err(err) => match failure_mode {
            FailureMode::FailOpen => {
                tracing::warn!(error = %err, "rate limiter backend error, failing open");
                Ok(true)
            }
            FailureMode::FailClosed => Err(err),
        },
    }
}
