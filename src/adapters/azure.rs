//! Azure OpenAI: deployment name is embedded in the path (percent-encoded)
//! rather than the request body, the API version travels as a query
//! parameter, and auth is an `api-key` header instead of a bearer token.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use crate::deployment::Deployment;
use crate::error::{GatewayError, LlmError};
use crate::schemas::{ChatRequest, ChatResponse, StreamChunk};

use super::{encode_path_segment, validate_base_url, Adapter};

const API_VERSION: &str = "2023-12-01-preview";

pub struct AzureAdapter;

impl AzureAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AzureAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for AzureAdapter {
    fn name(&self) -> &str {
        "azure"
    }

    fn build_request(&self, http: &Client, deployment: &Deployment, request: &ChatRequest) -> Result<RequestBuilder, GatewayError> {
        let base = validate_base_url(deployment)?;
        let model_id = deployment.alias.as_deref().unwrap_or(&deployment.model);
        let path = format!("openai/deployments/{}/chat/completions", encode_path_segment(model_id));
        let mut url = base.join(&path).map_err(GatewayError::from)?;
        url.query_pairs_mut().append_pair("api-version", API_VERSION);

        // Native body carries no `model` field; the deployment name in the
        // path already identifies it.
        let mut native = request.sanitized(&deployment.model);
        native.model = String::new();

        let mut builder = http.post(url).json(&native);
        if let Some(token) = &deployment.credential {
            builder = builder.header("api-key", token);
        }
        for (key, value) in &deployment.extra_headers {
            builder = builder.header(key, value);
        }
        Ok(builder)
    }

    fn parse_response(&self, deployment: &Deployment, status: u16, body: &str) -> Result<ChatResponse, GatewayError> {
        if status >= 400 {
            return Err(GatewayError::Upstream(self.map_error(deployment, status, body)));
        }
        let mut response: ChatResponse = serde_json::from_str(body).map_err(GatewayError::from)?;
        if response.model.is_empty() {
            response.model = deployment.model.clone();
        }
        Ok(response)
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
}
