use std::time::Duration;

/// Process configuration, read from the environment. Every field has a
/// default so a bare `tollgate bootstrap.json` starts against a local
/// Redis.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub redis_url: String,
    /// Total timeout per upstream attempt.
    pub upstream_timeout: Duration,
    /// How long shutdown waits for deferred bookkeeping.
    pub shutdown_deadline: Duration,
    /// Enables `POST /admin/tenants` when set.
    pub admin_api_key: Option<String>,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_port: env_parsed("SERVER_PORT", 8080),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            upstream_timeout: Duration::from_secs(env_parsed("LLM_TIMEOUT_SECS", 60)),
            shutdown_deadline: Duration::from_secs(env_parsed("SHUTDOWN_DEADLINE_SECS", 10)),
            admin_api_key: std::env::var("ADMIN_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            json_logs: env_or("LOG_FORMAT", "text") == "json",
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(fallback)
}
