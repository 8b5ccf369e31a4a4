//! # llmux
//!
//! A request gateway library for routing chat/embedding calls across LLM
//! provider deployments with health-aware load balancing, retries, fallback
//! and streaming recovery.
//!
//! ## Architecture
//!
//! - [`client`] — the Public Client: construction, chat/embedding entry
//!   points, provider management
//! - [`config`] — `GatewayConfig` and its builder
//! - [`deployment`] — a single routable endpoint
//! - [`router`] — deployment selection, cooldown/circuit-breaker policy
//! - [`stats`] — per-deployment rolling/EWMA/window metrics, in-process and
//!   distributed
//! - [`rate_limiter`] — pre-request descriptor-based rate limiting
//! - [`pricing`] — model cost lookup for the lowest-cost strategy and
//!   pricing enforcement
//! - [`cache`] — response caching keyed on tenant-scoped request content
//! - [`executor`] — the non-streaming request path: pick, execute, retry,
//!   fall back
//! - [`streaming`] — the streaming request path, with mid-stream recovery
//! - [`adapters`] — per-provider request/response translation
//! - [`plugins`] — pre/post request hooks
//! - [`schemas`] — normalized request/response wire types
//! - [`error`] — the error taxonomy
//! - [`core`] — shared HTTP client construction

pub mod adapters;
pub mod cache;
pub mod client;
pub mod config;
pub mod core;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod plugins;
pub mod pricing;
pub mod rate_limiter;
pub mod router;
pub mod schemas;
pub mod stats;
#[cfg(feature = "streaming")]
pub mod streaming;
pub mod tokenizer;

pub use client::Client;
pub use config::{ClientConfigBuilder, GatewayConfig};
pub use deployment::{Deployment, DeploymentId};
pub use error::{GatewayError, LlmError, LlmErrorKind};
pub use executor::{ExecutorConfig, FallbackReporter};
pub use plugins::{Plugin, PluginPipeline, PreHookOutcome, ShortCircuit};
pub use pricing::{ModelCost, PricingRegistry};
pub use rate_limiter::{FailureMode, KeyStrategy, RateLimiter, RateLimiterConfig};
pub use router::{RequestContext, Router, RouterConfig, Strategy};
pub use schemas::{
    ChatRequest, ChatResponse, Choice, EmbeddingData, EmbeddingRequest, EmbeddingResponse, ListModelsResponse, Message, ModelInfo, Role,
    StreamChoice, StreamChunk, StreamDelta, Usage,
};
pub use stats::{DeploymentStats, StatsStore};

/// The result type used throughout the library.
pub type Result<T> = std::result::Result<T, GatewayError>;
