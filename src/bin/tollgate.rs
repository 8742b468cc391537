use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

use tollgate::{
    router, CachedTenantDirectory, Config, GatewayState, JsonlUsageSink, MemoryModelCatalog,
    MemoryTenantDirectory, MemoryUsageSink, ModelDescriptor, RedisCounterStore, Tenant,
    TenantDirectory, UsageSink,
};

/// Tenants and models seeded at startup. Production deployments push
/// tenants through `/admin/tenants`; the bootstrap file covers the rest.
#[derive(Debug, Deserialize)]
struct Bootstrap {
    #[serde(default)]
    tenants: Vec<Tenant>,
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: tollgate <bootstrap.json> [--listen HOST:PORT] [--usage-log PATH]")?;

    let mut listen: Option<String> = None;
    let mut usage_log: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--usage-log" => {
                usage_log = Some(args.next().ok_or("missing value for --usage-log")?.into());
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let config = Config::from_env();
    init_tracing(config.json_logs)?;

    let raw = std::fs::read_to_string(&path)?;
    let bootstrap: Bootstrap = serde_json::from_str(&raw)?;

    let directory = Arc::new(MemoryTenantDirectory::new());
    for tenant in bootstrap.tenants {
        directory.create(tenant).await?;
    }
    let catalog = Arc::new(MemoryModelCatalog::new());
    for model in bootstrap.models {
        catalog.insert(model);
    }

    let counters = Arc::new(RedisCounterStore::new(&config.redis_url)?);
    let usage: Arc<dyn UsageSink> = match usage_log {
        Some(path) => Arc::new(JsonlUsageSink::new(path)),
        None => Arc::new(MemoryUsageSink::new()),
    };

    let mut state = GatewayState::new(
        Arc::new(CachedTenantDirectory::new(directory)),
        catalog,
        usage,
        counters,
    )
    .with_upstream_timeout(config.upstream_timeout);
    if let Some(key) = config.admin_api_key.clone() {
        state = state.with_admin_key(key);
    }
    let supervisor = state.supervisor();

    let app = router(state);
    let listen = listen.unwrap_or_else(|| format!("0.0.0.0:{}", config.server_port));
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "tollgate listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("waiting for bookkeeping tasks to complete");
    if let Err(err) = supervisor.shutdown(config.shutdown_deadline).await {
        tracing::error!(error = %err, "bookkeeping drain incomplete");
    }
    tracing::info!("server exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutting down server");
}

fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
