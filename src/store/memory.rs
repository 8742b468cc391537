use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

use super::{
    now_epoch_seconds, rpm_key, tpm_key, CounterStore, ModelCatalog, ModelDescriptor, Tenant,
    TenantDirectory, UsageRecord, UsageSink,
};

/// In-process tenant directory, keyed by API key. Used by the binary's
/// bootstrap file and by tests.
#[derive(Default)]
pub struct MemoryTenantDirectory {
    tenants: Mutex<HashMap<String, Tenant>>,
    fail_lookups: AtomicBool,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent lookups fail with `StoreError::Unavailable`.
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn lookup(&self, api_key: &str) -> Result<Option<Tenant>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("tenant directory down".to_string()));
        }
        let tenants = self
            .tenants
            .lock()
            .map_err(|_| StoreError::Unavailable("tenant directory poisoned".to_string()))?;
        let tenant = match tenants.get(api_key) {
            Some(tenant) if tenant.active => tenant.clone(),
            _ => return Ok(None),
        };
        Ok(Some(tenant.with_defaults()))
    }

    async fn create(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut tenants = self
            .tenants
            .lock()
            .map_err(|_| StoreError::Unavailable("tenant directory poisoned".to_string()))?;
        tenants.insert(tenant.api_key.clone(), tenant);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryModelCatalog {
    models: Mutex<HashMap<String, ModelDescriptor>>,
}

impl MemoryModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: ModelDescriptor) {
        if let Ok(mut models) = self.models.lock() {
            models.insert(descriptor.model_id.clone(), descriptor);
        }
    }
}

#[async_trait]
impl ModelCatalog for MemoryModelCatalog {
    async fn lookup(&self, model_id: &str) -> Result<Option<ModelDescriptor>, StoreError> {
        let models = self
            .models
            .lock()
            .map_err(|_| StoreError::Unavailable("model catalog poisoned".to_string()))?;
        Ok(models.get(model_id).cloned())
    }
}

/// Usage sink that collects records in memory. Tests can inject failures
/// (to exercise the append retry) and latency (to exercise drain).
#[derive(Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
    fail_next: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` appends before succeeding again.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Adds an artificial latency to every append.
    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let delay = self.delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("usage sink down".to_string()));
        }
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::Unavailable("usage sink poisoned".to_string()))?;
        records.push(record.clone());
        Ok(())
    }
}

/// Counter store over an in-process map, honoring the same minute-bucket
/// key schema as the Redis implementation. TTLs are not simulated; stale
/// buckets are simply never read again.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, i64>>,
    fail: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every counter operation fail, for fail-closed tests.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn current_rpm(&self, tenant_id: &str) -> i64 {
        let key = rpm_key(tenant_id, now_epoch_seconds() / 60);
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(&key).copied())
            .unwrap_or(0)
    }

    fn add(&self, key: String, delta: i64) -> Result<i64, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("counter store down".to_string()));
        }
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Unavailable("counter store poisoned".to_string()))?;
        let entry = counters.entry(key).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_rpm(&self, tenant_id: &str) -> Result<i64, StoreError> {
        self.add(rpm_key(tenant_id, now_epoch_seconds() / 60), 1)
    }

    async fn increment_tpm(&self, tenant_id: &str, tokens: i64) -> Result<i64, StoreError> {
        self.add(tpm_key(tenant_id, now_epoch_seconds() / 60), tokens)
    }

    async fn get_tpm(&self, tenant_id: &str) -> Result<i64, StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("counter store down".to_string()));
        }
        let key = tpm_key(tenant_id, now_epoch_seconds() / 60);
        let counters = self
            .counters
            .lock()
            .map_err(|_| StoreError::Unavailable("counter store poisoned".to_string()))?;
        Ok(counters.get(&key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rpm_increments_are_strictly_increasing() {
        let store = MemoryCounterStore::new();
        let mut last = 0;
        for _ in 0..5 {
            let next = store.increment_rpm("t-1").await.unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn tpm_reads_zero_when_absent() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get_tpm("t-unseen").await.unwrap(), 0);
        store.increment_tpm("t-unseen", 40).await.unwrap();
        assert_eq!(store.get_tpm("t-unseen").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn counters_are_isolated_per_tenant() {
        let store = MemoryCounterStore::new();
        store.increment_rpm("t-a").await.unwrap();
        store.increment_rpm("t-a").await.unwrap();
        assert_eq!(store.increment_rpm("t-b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_store_surfaces_unavailable() {
        let store = MemoryCounterStore::new();
        store.fail(true);
        assert!(store.increment_rpm("t-1").await.is_err());
        assert!(store.get_tpm("t-1").await.is_err());
    }

    #[tokio::test]
    async fn inactive_tenant_is_not_found() {
        let directory = MemoryTenantDirectory::new();
        directory
            .create(Tenant {
                tenant_id: "t-1".to_string(),
                name: String::new(),
                api_key: "sk-1".to_string(),
                rpm_limit: 0,
                tpm_limit: 0,
                allowed_models: Vec::new(),
                active: false,
            })
            .await
            .unwrap();
        assert!(directory.lookup("sk-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_applies_defaults() {
        let directory = MemoryTenantDirectory::new();
        directory
            .create(Tenant {
                tenant_id: "t-1".to_string(),
                name: String::new(),
                api_key: "sk-1".to_string(),
                rpm_limit: 0,
                tpm_limit: 0,
                allowed_models: Vec::new(),
                active: true,
            })
            .await
            .unwrap();
        let tenant = directory.lookup("sk-1").await.unwrap().unwrap();
        assert_eq!(tenant.rpm_limit, 100);
        assert_eq!(tenant.tpm_limit, 100_000);
    }

    #[tokio::test]
    async fn sink_failure_injection_counts_down() {
        let sink = MemoryUsageSink::new();
        sink.fail_next(1);
        let record = UsageRecord {
            tenant_id: "t-1".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            request_id: "r-1".to_string(),
            model_id: "m".to_string(),
            input_tokens: 1,
            output_tokens: 2,
        };
        assert!(sink.append(&record).await.is_err());
        assert!(sink.append(&record).await.is_ok());
        assert_eq!(sink.len(), 1);
    }
}
