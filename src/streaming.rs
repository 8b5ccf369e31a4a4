//! Streaming Engine: same preflight as the executor, then a line-oriented
//! SSE scanner that yields normalized chunks and, on mid-stream failure,
//! recovers onto another deployment by replaying the conversation plus an
//! assistant continuation carrying the text emitted so far (spec §4.8).
//!
//! Grounded in the teacher's `streaming/core.rs` chunk/state bookkeeping and
//! `client.rs`'s SSE line-splitting (`data: ` prefix, `[DONE]` sentinel),
//! generalized to the provider-agnostic recovery flow the teacher itself
//! never needed (it proxies one fixed backend with no fallback concept).

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::adapters::AdapterRegistry;
use crate::deployment::Deployment;
use crate::error::{GatewayError, LlmError, LlmErrorKind};
use crate::executor::{backoff_duration, ExecutorConfig};
use crate::router::{RequestContext, Router};
use crate::schemas::{ChatRequest, Message, StreamChunk};
use crate::stats::SuccessMetrics;
use crate::tokenizer;

/// Minimum scanner buffer per spec §9 ("scanner buffer... MUST raise the
/// limit to >= 64 KiB").
pub const MIN_SCANNER_BUFFER: usize = 64 * 1024;

/// No global client timeout applies to stream bodies; this is the only
/// watchdog — an idle period with no new bytes aborts the leg as a failure.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct StreamingEngine {
    pub router: Arc<Router>,
    pub adapters: Arc<AdapterRegistry>,
    pub http: reqwest::Client,
    pub config: ExecutorConfig,
}

impl StreamingEngine {
    /// Starts the stream and returns a channel-backed `Stream` of chunks.
    /// Recovery happens transparently inside the background task; the
    /// caller only sees a single logical stream.
    pub async fn start(&self, request: ChatRequest, cancel: tokio_util::sync::CancellationToken) -> Result<UnboundedReceiverStream<Result<StreamChunk, GatewayError>>, GatewayError> {
        request.validate().map_err(GatewayError::InvalidRequest)?;

        let router_ctx = RequestContext {
            model: request.model.clone(),
            is_streaming: true,
            tags: request.tags.clone(),
            estimated_input_tokens: tokenizer::estimate_prompt_tokens(&request),
        };
        let deployment = self.router.pick_with_context(&router_ctx).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = StreamingRun {
            router: self.router.clone(),
            adapters: self.adapters.clone(),
            http: self.http.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(async move {
            engine.run(request, deployment, tx, cancel).await;
        });
        Ok(UnboundedReceiverStream::new(rx))
    }
}

struct StreamingRun {
    router: Arc<Router>,
    adapters: Arc<AdapterRegistry>,
    http: reqwest::Client,
    config: ExecutorConfig,
}

impl StreamingRun {
    async fn run(
        &self,
        original_request: ChatRequest,
        mut deployment: Deployment,
        tx: mpsc::UnboundedSender<Result<StreamChunk, GatewayError>>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut accumulated = String::new();
        let original_model = original_request.model.clone();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                let _ = tx.send(Err(GatewayError::Canceled));
                return;
            }

            let leg_request = if accumulated.is_empty() {
                original_request.clone()
            } else {
                recovery_request(&original_request, &accumulated)
            };

            match self.run_leg(&deployment, leg_request, &tx, &cancel, &mut accumulated).await {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    if cancel.is_cancelled() || attempt > self.config.retry_count {
                        let _ = tx.send(Err(err.with_accumulated(accumulated.clone())));
                        return;
                    }
                    warn!(deployment = %deployment.id, attempt, "stream leg failed, attempting recovery");
                    tokio::time::sleep(backoff_duration(attempt, &self.config)).await;
                    if !self.config.fallback_enabled {
                        let _ = tx.send(Err(err.with_accumulated(accumulated.clone())));
                        return;
                    }
                    let router_ctx = RequestContext { model: original_model.clone(), is_streaming: true, tags: original_request.tags.clone(), estimated_input_tokens: 0 };
                    match self.router.pick_with_context(&router_ctx).await {
                        Ok(next) => deployment = next,
                        Err(_) => {
                            let _ = tx.send(Err(err.with_accumulated(accumulated.clone())));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Runs a single upstream leg to completion (DONE) or failure. Returns
    /// `Ok(())` once DONE is observed; `requestEnded` is enforced by calling
    /// `report_request_end` exactly once regardless of exit path.
    async fn run_leg(
        &self,
        deployment: &Deployment,
        request: ChatRequest,
        tx: &mpsc::UnboundedSender<Result<StreamChunk, GatewayError>>,
        cancel: &tokio_util::sync::CancellationToken,
        accumulated: &mut String,
    ) -> Result<(), GatewayError> {
        let adapter = self
            .adapters
            .get(&deployment.provider)
            .ok_or_else(|| GatewayError::Config(format!("no adapter registered for provider type {}", deployment.provider)))?;

        let sanitized = {
            let mut req = request.sanitized(&deployment.model);
            req.stream = Some(true);
            req
        };

        self.router.report_request_start(&deployment.id).await?;
        let mut request_ended = false;
        let start = Instant::now();
        let mut ttft: Option<f64> = None;
        let is_single = self.router.is_single_deployment(&request.model);

        let result = self.drive_leg(deployment, &adapter, sanitized, tx, cancel, accumulated, &mut ttft, start).await;

        match &result {
            Ok(seen_done) if *seen_done => {
                self.router.report_success(&deployment.id, SuccessMetrics { latency_ms: start.elapsed().as_secs_f64() * 1000.0, ttft_ms: ttft, tokens: 0 }).await?;
                self.router.report_request_end(&deployment.id).await?;
                request_ended = true;
            }
            Ok(false) => {
                let err = LlmError::new(LlmErrorKind::ServiceUnavailable, &deployment.provider, &deployment.model, "stream ended before DONE");
                self.router.report_failure(&deployment.id, &err, is_single).await?;
                self.router.report_request_end(&deployment.id).await?;
                request_ended = true;
                return Err(GatewayError::Upstream(err));
            }
            Err(_) => {
                let err = LlmError::new(LlmErrorKind::ServiceUnavailable, &deployment.provider, &deployment.model, "stream transport error");
                self.router.report_failure(&deployment.id, &err, is_single).await?;
                self.router.report_request_end(&deployment.id).await?;
                request_ended = true;
            }
        }

        debug_assert!(request_ended, "reportRequestEnd must be called exactly once per leg");
        result.map(|_| ())
    }

    /// Returns `Ok(true)` if DONE was observed, `Ok(false)` if the body ended
    /// without it, `Err` on a transport/read-idle failure.
    async fn drive_leg(
        &self,
        deployment: &Deployment,
        adapter: &Arc<dyn crate::adapters::Adapter>,
        request: ChatRequest,
        tx: &mpsc::UnboundedSender<Result<StreamChunk, GatewayError>>,
        cancel: &tokio_util::sync::CancellationToken,
        accumulated: &mut String,
        ttft: &mut Option<f64>,
        start: Instant,
    ) -> Result<bool, GatewayError> {
        let builder = adapter.build_request(&self.http, deployment, &request)?;
        let response = builder.send().await?;
        if response.status().as_u16() >= 400 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(adapter.map_error(deployment, status, &body)));
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(MIN_SCANNER_BUFFER);

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Canceled);
            }

            let next = tokio::time::timeout(READ_IDLE_TIMEOUT, byte_stream.next()).await;
            let chunk_bytes: Option<Result<Bytes, reqwest::Error>> = match next {
                Ok(item) => item,
                Err(_) => return Err(GatewayError::Transport("stream read-idle timeout".into())),
            };

            match chunk_bytes {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line_bytes);
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        if line.trim() == "data: [DONE]" || line.trim() == "data:[DONE]" {
                            return Ok(true);
                        }
                        let Some(chunk) = adapter.parse_stream_chunk(deployment, line) else { continue };
                        if ttft.is_none() {
                            if let Some(choice) = chunk.choices.first() {
                                if choice.delta.content.as_deref().is_some_and(|c| !c.is_empty()) {
                                    *ttft = Some(start.elapsed().as_secs_f64() * 1000.0);
                                }
                            }
                        }
                        for choice in &chunk.choices {
                            if let Some(content) = &choice.delta.content {
                                accumulated.push_str(content);
                            }
                        }
                        if tx.send(Ok(chunk)).is_err() {
                            return Err(GatewayError::Canceled);
                        }
                    }
                }
                Some(Err(err)) => return Err(GatewayError::from(err)),
                None => return Ok(false),
            }
        }
    }
}

/// A shallow copy of the original request with one extra assistant message
/// whose content is the accumulated text so far (spec §4.8 step 3).
fn recovery_request(original: &ChatRequest, accumulated: &str) -> ChatRequest {
    let mut request = original.clone();
    request.messages.push(Message::assistant(accumulated.to_string()));
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
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
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn recovery_request_appends_an_assistant_continuation() {
        let original = base_request();
        let recovered = recovery_request(&original, "Hello, this is ");
        let last = recovered.messages.last().unwrap();
        assert!(matches!(last.role, crate::schemas::Role::Assistant));
        assert_eq!(last.content.as_str(), Some("Hello, this is "));
        assert_eq!(recovered.messages.len(), original.messages.len() + 1);
    }
}
