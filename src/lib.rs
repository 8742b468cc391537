pub mod breaker;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod store;
pub mod supervisor;

pub use breaker::{BreakerConfig, BreakerOpen, CircuitBreaker};
pub use config::Config;
pub use error::{ShutdownError, StoreError};
pub use http::{router, GatewayState};
pub use metrics::GatewayMetrics;
pub use store::{
    CachedTenantDirectory, CounterStore, JsonlUsageSink, MemoryCounterStore, MemoryModelCatalog,
    MemoryTenantDirectory, MemoryUsageSink, ModelCatalog, ModelDescriptor, RedisCounterStore,
    Tenant, TenantDirectory, UsageRecord, UsageSink,
};
pub use supervisor::Supervisor;
