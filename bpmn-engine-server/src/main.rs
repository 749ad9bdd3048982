//! HTTP entry point. Grounded on the teacher's `bpmn-lite-server/src/main.rs`:
//! parse a database URL from `--database-url`/`DATABASE_URL`, fall back to
//! `MemoryEventStore` when unset or the `sqlite` feature isn't compiled in,
//! wire the engine, and serve. Swapped from the teacher's tonic/gRPC
//! transport to axum, matching this spec's HTTP webhook surface (§6).

use std::sync::Arc;

use bpmn_engine_core::broadcaster::Broadcaster;
use bpmn_engine_core::config::EngineConfig;
use bpmn_engine_core::message_queue::MessageQueue;
use bpmn_engine_core::scheduler::Engine;
use bpmn_engine_core::store::EventStore;
use bpmn_engine_core::store_memory::MemoryEventStore;
use bpmn_engine_server::build_router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env(parse_database_url_arg());

    let store: Arc<dyn EventStore> = build_store(&config).await?;

    let broadcaster = Arc::new(Broadcaster::new(store, config.subscriber_buffer));
    let queue = Arc::new(MessageQueue::new(config.mailbox_warning_threshold));
    let engine = Engine::new(broadcaster, queue, config.clone());

    let app = build_router(engine)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "bpmn-engine-server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn build_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    use bpmn_engine_core::store_sqlite::open_sqlite_store;

    match &config.database_url {
        Some(url) => {
            tracing::info!(url, "connecting to SQLite event store");
            let store = open_sqlite_store(url).await?;
            tracing::info!("SQLite event store ready (migrations applied)");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("no database URL configured, using MemoryEventStore");
            Ok(Arc::new(MemoryEventStore::new()))
        }
    }
}

#[cfg(not(feature = "sqlite"))]
async fn build_store(config: &EngineConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    if config.database_url.is_some() {
        tracing::warn!(
            "--database-url / DATABASE_URL set but the sqlite feature is not compiled in, using MemoryEventStore"
        );
    } else {
        tracing::info!("using MemoryEventStore (no database URL configured)");
    }
    Ok(Arc::new(MemoryEventStore::new()))
}

/// `--database-url <url>` CLI arg takes precedence over `DATABASE_URL`
/// (the env var lookup happens inside `EngineConfig::from_env`).
fn parse_database_url_arg() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2).find(|w| w[0] == "--database-url").map(|w| w[1].clone())
}
