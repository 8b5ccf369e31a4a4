//! Shared base for every OpenAI wire-compatible backend (OpenAI itself,
//! LightLLM, vLLM, and arbitrary OpenAI-compatible "custom" endpoints).
//! Per spec §1, individual adapter bodies are out of scope; this single base
//! carries the shape all of them share, differing only in their provider
//! type label used for pricing/cooldown bookkeeping.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::deployment::Deployment;
use crate::error::{GatewayError, LlmError};
use crate::schemas::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamChunk};

use super::{validate_base_url, Adapter};

pub struct OpenAiCompatibleAdapter {
    provider_type: &'static str,
}

impl OpenAiCompatibleAdapter {
    pub fn new(provider_type: &'static str) -> Self {
        Self { provider_type }
    }

    fn auth(&self, builder: RequestBuilder, deployment: &Deployment) -> RequestBuilder {
        match &deployment.credential {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl Adapter for OpenAiCompatibleAdapter {
    fn name(&self) -> &str {
        self.provider_type
    }

    fn supports_embedding(&self) -> bool {
        true
    }

    fn build_request(&self, http: &Client, deployment: &Deployment, request: &ChatRequest) -> Result<RequestBuilder, GatewayError> {
        let base = validate_base_url(deployment)?;
        let url = base.join("chat/completions").map_err(GatewayError::from)?;
        debug!(provider = %deployment.provider, model = %deployment.model, %url, "building chat completion request");
        let mut builder = http.post(url).json(request);
        builder = self.auth(builder, deployment);
        for (key, value) in &deployment.extra_headers {
            builder = builder.header(key, value);
        }
        Ok(builder)
    }

    fn parse_response(&self, deployment: &Deployment, status: u16, body: &str) -> Result<ChatResponse, GatewayError> {
        if status >= 400 {
            return Err(GatewayError::Upstream(self.map_error(deployment, status, body)));
        }
        serde_json::from_str(body).map_err(GatewayError::from)
    }

    fn parse_stream_chunk(&self, _deployment: &Deployment, event: &str) -> Option<StreamChunk> {
        let data = event.strip_prefix("data:").map(str::trim)?;
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    fn map_error(&self, deployment: &Deployment, status: u16, body: &str) -> LlmError {
        LlmError::from_status_body(status, body, &deployment.provider, &deployment.model)
    }

    fn build_embedding_request(&self, http: &Client, deployment: &Deployment, request: &EmbeddingRequest) -> Result<RequestBuilder, GatewayError> {
        let base = validate_base_url(deployment)?;
        let url = base.join("embeddings").map_err(GatewayError::from)?;
        let mut builder = http.post(url).json(request);
        builder = self.auth(builder, deployment);
        Ok(builder)
    }

    fn parse_embedding_response(&self, deployment: &Deployment, status: u16, body: &str) -> Result<EmbeddingResponse, GatewayError> {
        if status >= 400 {
            return Err(GatewayError::Upstream(self.map_error(deployment, status, body)));
        }
        serde_json::from_str(body).map_err(GatewayError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stream_chunk_skips_the_done_marker() {
        let adapter = OpenAiCompatibleAdapter::new("openai");
        let deployment = Deployment::new("d", "openai", "gpt-4o", "https://api.openai.com");
        assert!(adapter.parse_stream_chunk(&deployment, "data: [DONE]").is_none());
        assert!(adapter.parse_stream_chunk(&deployment, "").is_none());
    }

    #[test]
    fn parse_stream_chunk_parses_a_content_delta() {
        let adapter = OpenAiCompatibleAdapter::new("openai");
        let deployment = Deployment::new("d", "openai", "gpt-4o", "https://api.openai.com");
        let event = r#"data: {"id":"1","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hi"}}]}"#;
        let chunk = adapter.parse_stream_chunk(&deployment, event).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
    }
}
