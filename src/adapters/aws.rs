//! AWS Bedrock: the model id is embedded (percent-encoded) in the invoke
//! path rather than the JSON body. Request signing is SigV4, which is
//! genuinely out of scope here (spec §1 scopes out individual adapter
//! bodies) — the signing header is a named stub a real deployment would
//! replace with a signing middleware; it exists to demonstrate the
//! non-uniform request shape, not to be production-correct against Bedrock.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};

use crate::deployment::Deployment;
use crate::error::{GatewayError, LlmError};
use crate::schemas::{ChatRequest, ChatResponse, StreamChunk};

use super::{encode_path_segment, validate_base_url, Adapter};

pub struct BedrockAdapter;

impl BedrockAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BedrockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for BedrockAdapter {
    fn name(&self) -> &str {
        "bedrock"
    }

    fn build_request(&self, http: &Client, deployment: &Deployment, request: &ChatRequest) -> Result<RequestBuilder, GatewayError> {
        let base = validate_base_url(deployment)?;
        let path = format!("model/{}/invoke", encode_path_segment(&deployment.model));
        let url = base.join(&path).map_err(GatewayError::from)?;
        let native = request.sanitized(&deployment.model);
        let mut builder = http.post(url).json(&native);
        if let Some(token) = &deployment.credential {
            // Stand-in for a SigV4 `Authorization` header; see module docs.
            builder = builder.header("x-amz-bedrock-token", token);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_path_embeds_the_percent_encoded_model_id() {
        let adapter = BedrockAdapter::new();
        let http = Client::new();
        let deployment = Deployment::new("d", "bedrock", "anthropic.claude-3-sonnet", "https://bedrock-runtime.us-east-1.amazonaws.com");
        let request = ChatRequest {
            model: "bedrock/anthropic.claude-3-sonnet".into(),
            messages: vec![crate::schemas::Message::user("hi")],
            stream: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            n: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
            tags: vec![],
            extra: Default::default(),
        };
        let built = adapter.build_request(&http, &deployment, &request).unwrap().build().unwrap();
        assert!(built.url().path().contains("anthropic.claude-3-sonnet"));
    }
}
