use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;

use super::{now_epoch_seconds, rpm_key, tpm_key, CounterStore};

/// Strictly greater than the 60 s window, to absorb clock skew and query
/// timing. Stale keys become unreferenced once the minute rolls over.
const COUNTER_TTL_SECS: i64 = 90;

/// Fixed-window counters against a shared Redis, one key per
/// `(tenant, kind, minute)`.
///
/// Increment-then-expire is not atomic: if the TTL set fails the counter
/// never expires, which is acceptable because the key is never read after
/// the minute boundary.
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get("rate_limit:__ping__").await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_rpm(&self, tenant_id: &str) -> Result<i64, StoreError> {
        let key = rpm_key(tenant_id, now_epoch_seconds() / 60);
        let mut conn = self.connection().await?;
        let count: i64 = conn.incr(&key, 1).await?;
        if count == 1 {
            // Best effort; a lost TTL leaves an unreferenced key behind.
            let _: redis::RedisResult<()> = conn.expire(&key, COUNTER_TTL_SECS).await;
        }
        Ok(count)
    }

    async fn increment_tpm(&self, tenant_id: &str, tokens: i64) -> Result<i64, StoreError> {
        let key = tpm_key(tenant_id, now_epoch_seconds() / 60);
        let mut conn = self.connection().await?;
        let count: i64 = conn.incr(&key, tokens).await?;
        if count == tokens {
            let _: redis::RedisResult<()> = conn.expire(&key, COUNTER_TTL_SECS).await;
        }
        Ok(count)
    }

    async fn get_tpm(&self, tenant_id: &str) -> Result<i64, StoreError> {
        let key = tpm_key(tenant_id, now_epoch_seconds() / 60);
        let mut conn = self.connection().await?;
        let value: Option<i64> = conn.get(&key).await?;
        Ok(value.unwrap_or(0))
    }
}
