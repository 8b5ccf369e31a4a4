//! Error taxonomy for the gateway.
//!
//! `LlmError` is the fixed set of kinds every adapter, the router and the
//! executor agree on: each kind carries its own HTTP status and a fixed
//! retryability flag, so retry/fallback/cooldown decisions are a property of
//! the *type*, never of the call site. `GatewayError` wraps it for failures
//! that never reach a provider (bad config, preflight validation, transport).

use thiserror::Error;

/// One of the fixed taxonomy kinds. Status and retryability are intrinsic to
/// the kind, not configurable per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Authentication,
    RateLimit,
    InvalidRequest,
    NotFound,
    Timeout,
    ServiceUnavailable,
    Internal,
    ContextLength,
    ContentPolicy,
}

impl LlmErrorKind {
    pub fn status(&self) -> u16 {
        match self {
            Self::Authentication => 401,
            Self::RateLimit => 429,
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::Timeout => 408,
            Self::ServiceUnavailable => 503,
            Self::Internal => 500,
            Self::ContextLength => 400,
            Self::ContentPolicy => 400,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::ServiceUnavailable)
    }

    /// Map an upstream HTTP status to a taxonomy kind. Status takes
    /// precedence; the body is only consulted by `LlmError::from_status_body`
    /// for the few kinds no status code distinguishes (context length,
    /// content policy).
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            400 => Self::InvalidRequest,
            404 => Self::NotFound,
            408 => Self::Timeout,
            503 | 502 | 500..=599 => Self::ServiceUnavailable,
            _ => Self::Internal,
        }
    }
}

/// A typed error produced by a provider adapter's `map_error`, or by the
/// executor/streaming engine when translating a transport failure.
#[derive(Debug, Clone, Error)]
#[error("{kind:?} ({status}) from {provider}/{model}: {message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub status: u16,
    pub message: String,
    pub provider: String,
    pub model: String,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, provider: impl Into<String>, model: impl Into<String>, message: impl Into<String>) -> Self {
        let status = kind.status();
        Self {
            kind,
            status,
            message: message.into(),
            provider: provider.into(),
            model: model.into(),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// `cooldownRequired` from spec.md §4.2: true for 401, 404, 408, 429 and
    /// all 5xx; false for any other 4xx.
    pub fn cooldown_required(&self) -> bool {
        matches!(self.status, 401 | 404 | 408 | 429) || (500..=599).contains(&self.status)
    }

    /// Map an upstream status + body to exactly one taxonomy kind. Status
    /// decides first; the body is only used to refine 400s into the
    /// context-length / content-policy kinds when the provider's error type
    /// field says so.
    pub fn from_status_body(status: u16, body: &str, provider: &str, model: &str) -> Self {
        let kind = if status == 400 {
            let lower = body.to_ascii_lowercase();
            if lower.contains("context_length") || lower.contains("maximum context length") {
                LlmErrorKind::ContextLength
            } else if lower.contains("content_policy") || lower.contains("content management") {
                LlmErrorKind::ContentPolicy
            } else {
                LlmErrorKind::InvalidRequest
            }
        } else {
            LlmErrorKind::from_status(status)
        };
        Self::new(kind, provider, model, body)
    }
}

/// Failures that occur before (or without ever reaching) a provider: bad
/// configuration, preflight validation, infrastructure (stats store, rate
/// limiter) errors, and typed upstream errors once they've been classified.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("no deployments available for model {0}")]
    NoDeployments(String),

    #[error("no deployments with a matching tag for model {0}")]
    NoDeploymentsWithTag(String),

    #[error("pricing unknown for {provider}/{model} and pricing enforcement is enabled")]
    PricingUnknown { provider: String, model: String },

    #[error(transparent)]
    Upstream(#[from] LlmError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream ended with error after emitting partial content: {source}")]
    Stream {
        #[source]
        source: Box<GatewayError>,
        accumulated: String,
    },

    #[error("request canceled")]
    Canceled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::Upstream(e) => e.retryable(),
            Self::Transport(_) => true,
            _ => false,
        }
    }

    pub fn with_accumulated(self, accumulated: String) -> Self {
        Self::Stream {
            source: Box::new(self),
            accumulated,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Upstream(LlmError::new(LlmErrorKind::Timeout, "unknown", "unknown", err.to_string()))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json error: {err}"))
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid url: {err}"))
    }
}
