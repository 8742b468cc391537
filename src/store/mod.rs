mod cache;
mod jsonl;
mod memory;
mod redis;

pub use cache::CachedTenantDirectory;
pub use jsonl::JsonlUsageSink;
pub use memory::{
    MemoryCounterStore, MemoryModelCatalog, MemoryTenantDirectory, MemoryUsageSink,
};
pub use redis::RedisCounterStore;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const DEFAULT_RPM_LIMIT: u32 = 100;
const DEFAULT_TPM_LIMIT: u32 = 100_000;

/// Principal authenticated by an API key; the unit of quota and isolation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub rpm_limit: u32,
    #[serde(default)]
    pub tpm_limit: u32,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Tenant {
    /// Fills in the documented defaults for unset limits and model lists.
    /// Applied at read time by the directory implementations.
    pub fn with_defaults(mut self) -> Self {
        if self.rpm_limit == 0 {
            self.rpm_limit = DEFAULT_RPM_LIMIT;
        }
        if self.tpm_limit == 0 {
            self.tpm_limit = DEFAULT_TPM_LIMIT;
        }
        if self.allowed_models.is_empty() {
            self.allowed_models = vec!["*".to_string()];
        }
        self
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models
            .iter()
            .any(|allowed| allowed == "*" || allowed == model)
    }
}

/// Where a logical model name resolves to: an ordered list of complete
/// upstream endpoint URLs (first is primary, the rest are failover) plus
/// the name of the environment variable holding the upstream credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub base_urls: Vec<String>,
    #[serde(default)]
    pub api_key_env: String,
}

/// One row of the billing archive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: String,
    /// RFC 3339 with sub-second precision, captured at request start.
    pub timestamp: String,
    pub request_id: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// `Ok(None)` means unknown key; inactive tenants are surfaced as
    /// not-found so callers cannot distinguish the two.
    async fn lookup(&self, api_key: &str) -> Result<Option<Tenant>, StoreError>;

    async fn create(&self, tenant: Tenant) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn lookup(&self, model_id: &str) -> Result<Option<ModelDescriptor>, StoreError>;
}

/// Append-only record of per-request consumption. Idempotency is not
/// required; duplicates are tolerable.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError>;
}

/// Per-tenant per-minute RPM/TPM counters against a shared fast store.
///
/// The key schema changes every 60 seconds, so a counter whose TTL was
/// never attached simply becomes unreferenced after the minute boundary.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments the current minute's request counter and
    /// returns the new value.
    async fn increment_rpm(&self, tenant_id: &str) -> Result<i64, StoreError>;

    /// Atomic add on the current minute's token counter.
    async fn increment_tpm(&self, tenant_id: &str, tokens: i64) -> Result<i64, StoreError>;

    /// Current token count for the tenant's minute bucket, 0 when absent.
    async fn get_tpm(&self, tenant_id: &str) -> Result<i64, StoreError>;
}

pub(crate) fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub(crate) fn rpm_key(tenant_id: &str, minute: u64) -> String {
    format!("rate_limit:rpm:{tenant_id}:{minute}")
}

pub(crate) fn tpm_key(tenant_id: &str, minute: u64) -> String {
    format!("rate_limit:tpm:{tenant_id}:{minute}")
}
