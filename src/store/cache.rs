use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreError;

use super::{Tenant, TenantDirectory};

const DEFAULT_TENANT_TTL: Duration = Duration::from_secs(60 * 60);

struct CachedTenant {
    tenant: Tenant,
    expires_at: Instant,
}

/// Read-through cache in front of a tenant directory. Reads are common
/// and take the read lock; writes happen only on a miss. Entries are
/// replaced whole, so a reader never observes a torn pair. Invalidation
/// is purely time-based.
pub struct CachedTenantDirectory {
    inner: Arc<dyn TenantDirectory>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedTenant>>,
}

impl CachedTenantDirectory {
    pub fn new(inner: Arc<dyn TenantDirectory>) -> Self {
        Self {
            inner,
            ttl: DEFAULT_TENANT_TTL,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cached(&self, api_key: &str) -> Option<Tenant> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(api_key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.tenant.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl TenantDirectory for CachedTenantDirectory {
    async fn lookup(&self, api_key: &str) -> Result<Option<Tenant>, StoreError> {
        if let Some(tenant) = self.cached(api_key) {
            return Ok(Some(tenant));
        }

        let tenant = self.inner.lookup(api_key).await?;
        // Negative results are not cached: a just-provisioned key should
        // work without waiting out the TTL.
        if let Some(tenant) = tenant.as_ref() {
            if let Ok(mut entries) = self.entries.write() {
                entries.insert(
                    api_key.to_string(),
                    CachedTenant {
                        tenant: tenant.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
        }
        Ok(tenant)
    }

    async fn create(&self, tenant: Tenant) -> Result<(), StoreError> {
        self.inner.create(tenant).await
    }
}
