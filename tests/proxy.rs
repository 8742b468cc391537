mod common;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use tower::util::ServiceExt;

use common::{body_json, harness, model, seed_tenant, tenant, wait_for_usage};

fn chat_body() -> serde_json::Value {
    json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test]
async fn forwards_body_and_injects_upstream_credential() {
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "temperature": 0.7
    });
    let body_text = body.to_string();

    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .header("authorization", "Bearer sk-upstream")
            .header("x-client-extra", "kept")
            .body(body_text.as_str());
        then.status(200)
            .header("content-type", "application/json")
            .header("x-upstream-marker", "yes")
            .body(r#"{"id":"chatcmpl-1"}"#);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-fwd", "sk-fwd")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_FWD_KEY"));
    std::env::set_var("PROXY_FWD_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-fwd")
        .header("content-type", "application/json")
        .header("x-client-extra", "kept")
        .header("x-llm-retry-max", "2")
        .header("x-llm-retry-backoff-ms", "5")
        .body(axum::body::Body::from(body_text.clone()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-upstream-marker")
            .and_then(|v| v.to_str().ok()),
        Some("yes")
    );
    let text = common::body_string(response.into_body()).await;
    assert_eq!(text, r#"{"id":"chatcmpl-1"}"#);
    mock.assert();
}

#[tokio::test]
async fn non_streaming_usage_counts_are_len_over_four() {
    let upstream_body = r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hey"}}]}"#;
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST);
        then.status(200).body(upstream_body);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-usage", "sk-usage")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_USAGE_KEY"));
    std::env::set_var("PROXY_USAGE_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let body = chat_body();
    let request_len = body.to_string().len();
    let response = app
        .oneshot(common::completion_request("sk-usage", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    wait_for_usage(&h.usage, 1).await;
    let records = h.usage.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tenant_id, "t-usage");
    assert_eq!(records[0].model_id, "gpt-4o-mini");
    assert_eq!(records[0].input_tokens, (request_len / 4) as u64);
    assert_eq!(records[0].output_tokens, (upstream_body.len() / 4) as u64);
    assert!(!records[0].request_id.is_empty());
    assert!(records[0].timestamp.contains('T'));
}

#[tokio::test]
async fn invalid_json_body_is_bad_request() {
    let h = harness();
    seed_tenant(&h, tenant("t-bad", "sk-bad")).await;
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-bad")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Invalid JSON body");
}

#[tokio::test]
async fn too_many_messages_is_bad_request() {
    let h = harness();
    seed_tenant(&h, tenant("t-many", "sk-many")).await;
    let app = tollgate::router(h.state.clone());

    let messages: Vec<_> = (0..51)
        .map(|i| json!({"role": "user", "content": format!("m{i}")}))
        .collect();
    let body = json!({"model": "gpt-4o-mini", "messages": messages});
    let response = app
        .oneshot(common::completion_request("sk-many", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Too many messages in conversation (max: 50)");
}

#[tokio::test]
async fn empty_messages_array_is_admitted() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST);
        then.status(200).body(r#"{"id":"ok"}"#);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-empty", "sk-empty")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_EMPTY_KEY"));
    std::env::set_var("PROXY_EMPTY_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let body = json!({"model": "gpt-4o-mini", "messages": []});
    let response = app
        .oneshot(common::completion_request("sk-empty", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn oversized_body_is_rejected_before_upstream() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST);
        then.status(200).body("{}");
    });

    let h = harness();
    seed_tenant(&h, tenant("t-big", "sk-big")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_BIG_KEY"));
    std::env::set_var("PROXY_BIG_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let oversized = "x".repeat(10 * 1024 * 1024 + 1);
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-big")
        .body(axum::body::Body::from(oversized))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Request body too large (limit: 10MB)");
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn forbidden_model_never_reaches_upstream() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST);
        then.status(200).body("{}");
    });

    let h = harness();
    let mut t = tenant("t-fbd", "sk-fbd");
    t.allowed_models = vec!["claude-2".to_string()];
    seed_tenant(&h, t).await;
    h.catalog
        .insert(model("gpt-4", vec![upstream.url("/")], "PROXY_FBD_KEY"));
    std::env::set_var("PROXY_FBD_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let body = json!({"model": "gpt-4", "messages": []});
    let response = app
        .oneshot(common::completion_request("sk-fbd", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json_body = body_json(response.into_body()).await;
    assert_eq!(json_body["error"], "Model not allowed for this tenant");

    // No upstream contact, no usage record.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.calls(), 0);
    assert!(h.usage.is_empty());
}

#[tokio::test]
async fn unknown_model_is_not_found() {
    let h = harness();
    seed_tenant(&h, tenant("t-404", "sk-404")).await;
    let app = tollgate::router(h.state.clone());

    let response = app
        .oneshot(common::completion_request("sk-404", &chat_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Model configuration not found");
}

#[tokio::test]
async fn model_without_base_urls_is_internal_error() {
    let h = harness();
    seed_tenant(&h, tenant("t-cfg", "sk-cfg")).await;
    h.catalog
        .insert(model("gpt-4o-mini", Vec::new(), "PROXY_CFG_KEY"));
    let app = tollgate::router(h.state.clone());

    let response = app
        .oneshot(common::completion_request("sk-cfg", &chat_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Misconfigured model: no base URLs");
}

#[tokio::test]
async fn fails_over_on_429_without_backoff() {
    let primary = MockServer::start();
    let rate_limited = primary.mock(|when, then| {
        when.method(POST);
        then.status(429).body(r#"{"error":"slow down"}"#);
    });
    let backup = MockServer::start();
    let healthy = backup.mock(|when, then| {
        when.method(POST);
        then.status(200).body(r#"{"id":"from-backup"}"#);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-fo", "sk-fo")).await;
    h.catalog.insert(model(
        "gpt-4o-mini",
        vec![primary.url("/"), backup.url("/")],
        "PROXY_FO_KEY",
    ));
    std::env::set_var("PROXY_FO_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    // A large configured backoff proves the 429 leg skips it.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-fo")
        .header("x-llm-retry-backoff-ms", "5000")
        .body(axum::body::Body::from(chat_body().to_string()))
        .unwrap();

    let started = Instant::now();
    let response = app.oneshot(request).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(2000));
    assert_eq!(response.status(), StatusCode::OK);
    let text = common::body_string(response.into_body()).await;
    assert_eq!(text, r#"{"id":"from-backup"}"#);
    assert_eq!(rate_limited.calls(), 1);
    assert_eq!(healthy.calls(), 1);
}

#[tokio::test]
async fn each_attempt_resends_identical_bytes() {
    let body_text = chat_body().to_string();
    let primary = MockServer::start();
    let first = primary.mock(|when, then| {
        when.method(POST).body(body_text.as_str());
        then.status(500).body("boom");
    });
    let backup = MockServer::start();
    let second = backup.mock(|when, then| {
        when.method(POST).body(body_text.as_str());
        then.status(200).body(r#"{"id":"ok"}"#);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-bytes", "sk-bytes")).await;
    h.catalog.insert(model(
        "gpt-4o-mini",
        vec![primary.url("/"), backup.url("/")],
        "PROXY_BYTES_KEY",
    ));
    std::env::set_var("PROXY_BYTES_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-bytes")
        .header("x-llm-retry-backoff-ms", "0")
        .body(axum::body::Body::from(body_text.clone()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_upstream_5xx_as_502() {
    let upstream = MockServer::start();
    let failing = upstream.mock(|when, then| {
        when.method(POST);
        then.status(503).body("unavailable");
    });

    let h = harness();
    seed_tenant(&h, tenant("t-502", "sk-502")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_502_KEY"));
    std::env::set_var("PROXY_502_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-502")
        .header("x-llm-retry-max", "1")
        .header("x-llm-retry-backoff-ms", "0")
        .body(axum::body::Body::from(chat_body().to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Upstream provider error");
    assert_eq!(body["status"], 503);
    // retry_max=1 means two attempts against the single URL.
    assert_eq!(failing.calls(), 2);
}

#[tokio::test]
async fn transport_error_surfaces_as_502_with_details() {
    let h = harness();
    seed_tenant(&h, tenant("t-conn", "sk-conn")).await;
    // Nothing listens on port 9 on loopback.
    h.catalog.insert(model(
        "gpt-4o-mini",
        vec!["http://127.0.0.1:9/".to_string()],
        "PROXY_CONN_KEY",
    ));
    std::env::set_var("PROXY_CONN_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-conn")
        .header("x-llm-retry-max", "0")
        .body(axum::body::Body::from(chat_body().to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Upstream provider failed");
    assert!(body["details"].as_str().is_some());
}

#[tokio::test]
async fn retry_max_header_above_range_falls_back_to_default() {
    let upstream = MockServer::start();
    let failing = upstream.mock(|when, then| {
        when.method(POST);
        then.status(500).body("boom");
    });

    let h = harness();
    seed_tenant(&h, tenant("t-clip", "sk-clip")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_CLIP_KEY"));
    std::env::set_var("PROXY_CLIP_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-clip")
        .header("x-llm-retry-max", "99")
        .header("x-llm-retry-backoff-ms", "0")
        .body(axum::body::Body::from(chat_body().to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    // Default retry_max=3: four attempts, not a hundred.
    assert_eq!(failing.calls(), 4);
}

#[tokio::test]
async fn upstream_4xx_passes_through_unchanged() {
    let upstream = MockServer::start();
    upstream.mock(|when, then| {
        when.method(POST);
        then.status(400)
            .header("content-type", "application/json")
            .body(r#"{"error":{"message":"bad prompt"}}"#);
    });

    let h = harness();
    seed_tenant(&h, tenant("t-pass", "sk-pass")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_PASS_KEY"));
    std::env::set_var("PROXY_PASS_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    let response = app
        .oneshot(common::completion_request("sk-pass", &chat_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let text = common::body_string(response.into_body()).await;
    assert_eq!(text, r#"{"error":{"message":"bad prompt"}}"#);
}

#[tokio::test]
async fn breaker_opens_after_consecutive_upstream_failures() {
    let upstream = MockServer::start();
    let failing = upstream.mock(|when, then| {
        when.method(POST);
        then.status(500).body("boom");
    });

    let h = harness();
    seed_tenant(&h, tenant("t-cb", "sk-cb")).await;
    h.catalog
        .insert(model("gpt-4o-mini", vec![upstream.url("/")], "PROXY_CB_KEY"));
    std::env::set_var("PROXY_CB_KEY", "sk-upstream");
    let app = tollgate::router(h.state.clone());

    // Ten single-attempt requests, all 500: enough observations to trip.
    for _ in 0..10 {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("authorization", "Bearer sk-cb")
            .header("x-llm-retry-max", "0")
            .body(axum::body::Body::from(chat_body().to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
    assert_eq!(failing.calls(), 10);

    // The eleventh request short-circuits without touching the upstream.
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-cb")
        .header("x-llm-retry-max", "0")
        .body(axum::body::Body::from(chat_body().to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"], "Upstream provider failed");
    assert_eq!(body["details"], "circuit breaker is open");
    assert_eq!(failing.calls(), 10);
}
