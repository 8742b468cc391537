#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use serde_json::Value;
use tollgate::{
    GatewayState, MemoryCounterStore, MemoryModelCatalog, MemoryTenantDirectory, MemoryUsageSink,
    ModelDescriptor, Tenant, TenantDirectory,
};

pub struct Harness {
    pub directory: Arc<MemoryTenantDirectory>,
    pub catalog: Arc<MemoryModelCatalog>,
    pub usage: Arc<MemoryUsageSink>,
    pub counters: Arc<MemoryCounterStore>,
    pub state: GatewayState,
}

pub fn harness() -> Harness {
    let directory = Arc::new(MemoryTenantDirectory::new());
    let catalog = Arc::new(MemoryModelCatalog::new());
    let usage = Arc::new(MemoryUsageSink::new());
    let counters = Arc::new(MemoryCounterStore::new());
    let state = GatewayState::new(
        directory.clone(),
        catalog.clone(),
        usage.clone(),
        counters.clone(),
    );
    Harness {
        directory,
        catalog,
        usage,
        counters,
        state,
    }
}

pub fn tenant(tenant_id: &str, api_key: &str) -> Tenant {
    Tenant {
        tenant_id: tenant_id.to_string(),
        name: tenant_id.to_string(),
        api_key: api_key.to_string(),
        rpm_limit: 0,
        tpm_limit: 0,
        allowed_models: Vec::new(),
        active: true,
    }
}

pub fn model(model_id: &str, base_urls: Vec<String>, api_key_env: &str) -> ModelDescriptor {
    ModelDescriptor {
        model_id: model_id.to_string(),
        provider_name: "test".to_string(),
        base_urls,
        api_key_env: api_key_env.to_string(),
    }
}

pub async fn seed_tenant(harness: &Harness, tenant: Tenant) {
    harness.directory.create(tenant).await.unwrap();
}

pub fn completion_request(api_key: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {api_key}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_string(body: Body) -> String {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub async fn body_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Bookkeeping is deferred to a background task; poll until the records
/// land instead of guessing at sleeps.
pub async fn wait_for_usage(usage: &MemoryUsageSink, count: usize) {
    for _ in 0..200 {
        if usage.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "usage records did not arrive: have {}, want {count}",
        usage.len()
    );
}
