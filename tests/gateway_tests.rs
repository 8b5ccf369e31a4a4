//! Integration tests against `wiremock` stand-ins for provider endpoints,
//! covering the scenarios and invariants of spec.md §8 (S1-S8).

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llmux::{
    ChatRequest, ClientConfigBuilder, Client, Deployment, ExecutorConfig, GatewayError, LlmErrorKind, Message, RequestContext, Router,
    RouterConfig, StatsStore, Strategy,
};
use llmux::pricing::PricingRegistry;
use llmux::stats::memory::InMemoryStatsStore;

fn loopback_deployment(id: &str, provider: &str, model: &str, base_url: &str) -> Deployment {
    let mut d = Deployment::new(id, provider, model, base_url);
    d.allow_private_base_url = true;
    d
}

fn chat_request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![Message::user("Hello")],
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
    }
}

/// S1: a single successful call returns the upstream body verbatim, exactly
/// one HTTP request is made, and the Stats Store records one success.
#[tokio::test]
async fn s1_basic_call_returns_the_upstream_response_and_records_one_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "test-id",
            "created": 0,
            "model": "test-model",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt": 10, "completion": 5, "total": 15}
        })))
        .mount(&server)
        .await;

    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server.uri()))
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let response = client.chat_completion(chat_request("test-model"), None, None).await.unwrap();
    assert_eq!(response.id, "test-id");
    assert_eq!(response.choices[0].message.content.as_str(), Some("Hello!"));
    assert_eq!(response.usage.unwrap().total, 15);

    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let stats = client.stats().get_stats(&"dep-1".to_string()).await.unwrap().unwrap();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.success_count, 1);
}

/// S3: a non-retryable 400 surfaces as `invalid_request` after exactly one
/// call, and never sets a cooldown.
#[tokio::test]
async fn s3_non_retryable_error_makes_exactly_one_call_and_sets_no_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad request"})))
        .mount(&server)
        .await;

    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server.uri()))
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let err = client.chat_completion(chat_request("test-model"), None, None).await.unwrap_err();
    match err {
        GatewayError::Upstream(llm_err) => assert_eq!(llm_err.kind, LlmErrorKind::InvalidRequest),
        other => panic!("expected an upstream error, got {other:?}"),
    }

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    let stats = client.stats().get_stats(&"dep-1".to_string()).await.unwrap().unwrap();
    assert_eq!(stats.cooldown_until_ms, 0);
}

/// S6: a model with exactly one deployment never opens its circuit on 429,
/// even across repeated failures below the rate-window threshold.
#[tokio::test]
async fn s6_429_on_the_only_deployment_never_opens_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": "rate limited"})))
        .mount(&server)
        .await;

    let executor = ExecutorConfig { retry_count: 0, ..Default::default() };
    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server.uri()))
        .executor(executor)
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let _ = client.chat_completion(chat_request("test-model"), None, None).await;
    let _ = client.chat_completion(chat_request("test-model"), None, None).await;

    let id = "dep-1".to_string();
    assert_eq!(client.stats().get_cooldown_until(&id).await.unwrap(), 0);
}

/// S7: with one deployment's cost known to the pricing registry and another's
/// overridden explicitly, `Pick` always returns the cheaper one.
#[tokio::test]
async fn s7_lowest_cost_strategy_prefers_the_registry_priced_deployment() {
    let router = Router::new(
        RouterConfig { strategy: Strategy::LowestCost, ..Default::default() },
        std::sync::Arc::new(InMemoryStatsStore::new()),
        std::sync::Arc::new(PricingRegistry::new()),
    );
    router.add_deployment(Deployment::new("openai-dep", "openai", "gpt-4o", "https://api.openai.com"));
    router.add_deployment(Deployment::new("custom-dep", "custom", "gpt-4o", "https://custom.example").with_cost(0.5, 0.5));

    for _ in 0..10 {
        let picked = router.pick("gpt-4o").await.unwrap();
        assert_eq!(picked.id, "openai-dep");
    }
}

/// S8: identical request bodies for two different tenants never share a
/// cache entry, so the upstream is called once per tenant.
#[tokio::test]
async fn s8_cache_key_isolates_tenants() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "test-id",
            "created": 0,
            "model": "test-model",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt": 10, "completion": 5, "total": 15}
        })))
        .mount(&server)
        .await;

    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server.uri()))
        .cache_ttl(Duration::from_secs(60))
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    client.chat_completion(chat_request("test-model"), Some("tenant-a"), None).await.unwrap();
    client.chat_completion(chat_request("test-model"), Some("tenant-b"), None).await.unwrap();
    // Same tenant again: this one should be served from cache.
    client.chat_completion(chat_request("test-model"), Some("tenant-a"), None).await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

/// S2: the stream opens successfully after two upstream 500s, with the
/// third call reaching `[DONE]` immediately; the failing calls count against
/// the deployment but do not prevent the retry from reusing it.
#[tokio::test]
async fn s2_retry_then_succeed_over_a_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("data: [DONE]\n\n", "text/event-stream"))
        .mount(&server)
        .await;

    let executor = ExecutorConfig { retry_count: 3, backoff_base_ms: 5, backoff_max_ms: 20, ..Default::default() };
    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server.uri()))
        .executor(executor)
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let mut stream = Box::pin(client.chat_completion_stream(chat_request("test-model")).await.unwrap());
    let mut chunks = Vec::new();
    while let Some(item) = stream.next().await {
        chunks.push(item.unwrap());
    }
    assert!(chunks.is_empty());

    let stats = client.stats().get_stats(&"dep-1".to_string()).await.unwrap().unwrap();
    assert_eq!(stats.failure_count, 2);
    assert_eq!(stats.success_count, 1);
}

/// S4: cross-provider fallback. ProviderA always fails; round-robin ordering
/// puts it first, so its failure and providerB's eventual success are both
/// recorded for the right deployment.
#[tokio::test]
async fn s4_cross_provider_fallback_reads_from_the_healthy_provider() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;

    Mock::given(method("POST")).and(path("/chat/completions")).respond_with(ResponseTemplate::new(500)).mount(&server_a).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"id\":\"1\",\"created\":0,\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
            "text/event-stream",
        ))
        .mount(&server_b)
        .await;

    let executor = ExecutorConfig { retry_count: 2, backoff_base_ms: 5, backoff_max_ms: 20, ..Default::default() };
    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-a", "openai", "test-model", &server_a.uri()))
        .add_deployment(loopback_deployment("dep-b", "openai", "test-model", &server_b.uri()))
        .router(RouterConfig { strategy: Strategy::RoundRobin, ..Default::default() })
        .executor(executor)
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let mut stream = Box::pin(client.chat_completion_stream(chat_request("test-model")).await.unwrap());
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        let chunk = item.unwrap();
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                text.push_str(content);
            }
        }
    }
    assert_eq!(text, "hi");

    let a_stats = client.stats().get_stats(&"dep-a".to_string()).await.unwrap().unwrap();
    let b_stats = client.stats().get_stats(&"dep-b".to_string()).await.unwrap().unwrap();
    assert_eq!(a_stats.failure_count, 1);
    assert_eq!(b_stats.success_count, 1);
}

/// S5: mid-stream recovery. Server1 emits two chunks then closes without
/// `[DONE]`; server2 must see the accumulated text as an assistant
/// continuation message, and the caller sees the concatenation of both legs.
#[tokio::test]
async fn s5_mid_stream_recovery_preserves_partial_content() {
    let server_1 = MockServer::start().await;
    let server_2 = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"id\":\"1\",\"created\":0,\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello, \"}}]}\n\n\
             data: {\"id\":\"1\",\"created\":0,\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"this is \"}}]}\n\n",
            "text/event-stream",
        ))
        .mount(&server_1)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            "data: {\"id\":\"2\",\"created\":0,\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"a resilient \"}}]}\n\n\
             data: {\"id\":\"2\",\"created\":0,\"model\":\"test-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"system.\"}}]}\n\n\
             data: [DONE]\n\n",
            "text/event-stream",
        ))
        .mount(&server_2)
        .await;

    let executor = ExecutorConfig { retry_count: 2, backoff_base_ms: 5, backoff_max_ms: 20, ..Default::default() };
    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "test-model", &server_1.uri()))
        .add_deployment(loopback_deployment("dep-2", "openai", "test-model", &server_2.uri()))
        .router(RouterConfig { strategy: Strategy::RoundRobin, ..Default::default() })
        .executor(executor)
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    let mut stream = Box::pin(client.chat_completion_stream(chat_request("test-model")).await.unwrap());
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        let chunk = item.unwrap();
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                text.push_str(content);
            }
        }
    }
    assert_eq!(text, "Hello, this is a resilient system.");

    let requests_to_2 = server_2.received_requests().await.unwrap();
    assert_eq!(requests_to_2.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests_to_2[0].body).unwrap();
    let last_message = body["messages"].as_array().unwrap().last().unwrap();
    assert_eq!(last_message["role"], "assistant");
    assert_eq!(last_message["content"], "Hello, this is ");
}

/// Invariant 4: a `provider/model` request strips the prefix from the
/// outgoing body but still resolves via either key.
#[tokio::test]
async fn invariant4_prefixed_model_resolves_and_strips_in_the_outgoing_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "test-id",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt": 1, "completion": 1, "total": 2}
        })))
        .mount(&server)
        .await;

    let config = ClientConfigBuilder::new()
        .add_deployment(loopback_deployment("dep-1", "openai", "gpt-4o", &server.uri()))
        .build()
        .unwrap();
    let client = Client::new(config).unwrap();

    client.chat_completion(chat_request("openai/gpt-4o"), None, None).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4o");
}

/// Router-level sanity check used by several scenarios: resolving by the
/// router directly (outside the Client) via a `RequestContext`.
#[tokio::test]
async fn router_pick_with_context_resolves_by_composite_key() {
    let router = Router::new(
        RouterConfig::default(),
        std::sync::Arc::new(InMemoryStatsStore::new()),
        std::sync::Arc::new(PricingRegistry::new()),
    );
    router.add_deployment(Deployment::new("dep-1", "openai", "gpt-4o", "https://api.openai.com"));
    let ctx = RequestContext { model: "openai/gpt-4o".to_string(), ..Default::default() };
    let picked = router.pick_with_context(&ctx).await.unwrap();
    assert_eq!(picked.id, "dep-1");
}
