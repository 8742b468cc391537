pub(crate) mod admin;
pub(crate) mod middleware;
pub(crate) mod proxy;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::metrics::GatewayMetrics;
use crate::store::{CounterStore, ModelCatalog, TenantDirectory, UsageSink};
use crate::supervisor::Supervisor;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a request handler needs, cheaply cloneable.
#[derive(Clone)]
pub struct GatewayState {
    pub(crate) directory: Arc<dyn TenantDirectory>,
    pub(crate) catalog: Arc<dyn ModelCatalog>,
    pub(crate) usage: Arc<dyn UsageSink>,
    pub(crate) counters: Arc<dyn CounterStore>,
    pub(crate) metrics: Arc<GatewayMetrics>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) supervisor: Supervisor,
    pub(crate) client: reqwest::Client,
    pub(crate) admin_key: Option<String>,
}

impl GatewayState {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        catalog: Arc<dyn ModelCatalog>,
        usage: Arc<dyn UsageSink>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            directory,
            catalog,
            usage,
            counters,
            metrics: Arc::new(GatewayMetrics::new()),
            breaker: Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            supervisor: Supervisor::new(),
            client: build_client(DEFAULT_UPSTREAM_TIMEOUT),
            admin_key: None,
        }
    }

    /// Enables `POST /admin/tenants`. Without a key the route is not
    /// mounted at all.
    pub fn with_admin_key(mut self, key: impl Into<String>) -> Self {
        self.admin_key = Some(key.into());
        self
    }

    /// Rebuilds the shared upstream client with a different total
    /// timeout per attempt.
    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(config));
        self
    }

    /// Handle used by the binary to drain bookkeeping after the server
    /// stops accepting.
    pub fn supervisor(&self) -> Supervisor {
        self.supervisor.clone()
    }

    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        self.metrics.clone()
    }
}

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub fn router(state: GatewayState) -> Router {
    let completions = post(proxy::chat_completions)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authenticate,
        ));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/v1/chat/completions", completions);

    if state.admin_key.is_some() {
        router = router.route("/admin/tenants", post(admin::create_tenant));
    }

    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::observe,
        ))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<GatewayState>,
) -> (HeaderMap, String) {
    let mut headers = HeaderMap::new();
    if let Ok(value) = "text/plain; version=0.0.4".parse() {
        headers.insert("content-type", value);
    }
    (headers, state.metrics.render())
}

/// All caller-facing errors are JSON `{"error": <message>}`; no stack
/// traces or internal detail leak out.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
