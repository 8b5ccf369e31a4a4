//! Pre/post hooks around both the unary and streaming request paths. No
//! direct teacher analog; grounded in the shape of the teacher's `tools`
//! module (a registry of typed objects invoked in priority order), adapted
//! here from tool-execution hooks to request/response hooks.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::schemas::{ChatRequest, ChatResponse, StreamChunk};

pub struct ShortCircuit {
    pub response: ChatResponse,
    pub allow_fallback: bool,
}

pub enum PreHookOutcome {
    Continue(ChatRequest),
    ShortCircuit(Box<ShortCircuit>),
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32 {
        0
    }

    async fn pre_hook(&self, request: ChatRequest) -> Result<PreHookOutcome, GatewayError> {
        Ok(PreHookOutcome::Continue(request))
    }

    async fn post_hook(&self, response: Option<ChatResponse>, error: Option<&GatewayError>) -> Result<Option<ChatResponse>, GatewayError> {
        let _ = error;
        Ok(response)
    }

    async fn pre_stream_hook(&self, request: ChatRequest) -> Result<PreHookOutcome, GatewayError> {
        self.pre_hook(request).await
    }

    async fn on_stream_chunk(&self, chunk: StreamChunk) -> Result<StreamChunk, GatewayError> {
        Ok(chunk)
    }

    async fn post_stream_hook(&self, error: Option<&GatewayError>) -> Result<(), GatewayError> {
        let _ = error;
        Ok(())
    }
}

/// A fixed-order plugin list (lowest priority value first). Post-hooks run
/// in reverse from the index of the last pre-hook that actually ran, so a
/// short-circuit at plugin N still lets plugins `0..N` see the response.
pub struct PluginPipeline {
    plugins: Vec<std::sync::Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new(mut plugins: Vec<std::sync::Arc<dyn Plugin>>) -> Self {
        plugins.sort_by_key(|p| p.priority());
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Returns `(request or short-circuit response, count of pre-hooks that ran)`.
    pub async fn run_pre_hooks(&self, mut request: ChatRequest) -> Result<(PreHookResult, usize), GatewayError> {
        for (ran, plugin) in self.plugins.iter().enumerate() {
            match plugin.pre_hook(request).await? {
                PreHookOutcome::Continue(next) => request = next,
                PreHookOutcome::ShortCircuit(sc) => return Ok((PreHookResult::ShortCircuit(sc), ran + 1)),
            }
        }
        Ok((PreHookResult::Request(request), self.plugins.len()))
    }

    pub async fn run_post_hooks(&self, ran: usize, mut response: Option<ChatResponse>, mut error: Option<GatewayError>) -> (Option<ChatResponse>, Option<GatewayError>) {
        for plugin in self.plugins[..ran].iter().rev() {
            match plugin.post_hook(response.clone(), error.as_ref()).await {
                Ok(next) => response = next,
                Err(err) => error = Some(err),
            }
        }
        (response, error)
    }
}

pub enum PreHookResult {
    Request(ChatRequest),
    ShortCircuit(Box<ShortCircuit>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingPlugin {
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        async fn post_hook(&self, response: Option<ChatResponse>, _error: Option<&GatewayError>) -> Result<Option<ChatResponse>, GatewayError> {
            self.ran.store(true, Ordering::SeqCst);
            Ok(response)
        }
    }

    #[tokio::test]
    async fn post_hooks_run_for_plugins_that_already_ran_pre() {
        let ran = Arc::new(AtomicBool::new(false));
        let pipeline = PluginPipeline::new(vec![Arc::new(RecordingPlugin { ran: ran.clone() })]);
        let request = crate::schemas::ChatRequest {
            model: "m".into(),
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
        let (_result, count) = pipeline.run_pre_hooks(request).await.unwrap();
        pipeline.run_post_hooks(count, None, None).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
