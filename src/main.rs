//! Quiz Live Back node entrypoint wiring the session cache, scheduler, and
//! reconciliation layers.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_live_back::cluster::local::LocalTopology;
use quiz_live_back::config::AppConfig;
use quiz_live_back::dao::memory::InMemoryQuizStore;
use quiz_live_back::scheduler::LocalTaskScheduler;
use quiz_live_back::services::messaging::BroadcastGateway;
use quiz_live_back::services::schedule_service;
use quiz_live_back::services::statistics::TracingStatisticsSink;
use quiz_live_back::state::SessionContext;
use quiz_live_back::state::registry::CacheRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();

    let topology = Arc::new(LocalTopology::new(config.broadcast_capacity));
    let registry = CacheRegistry::new(topology);
    let scheduler = Arc::new(LocalTaskScheduler::new());
    let store = Arc::new(InMemoryQuizStore::new());
    let statistics = Arc::new(TracingStatisticsSink);
    let gateway = Arc::new(BroadcastGateway::new(config.gateway_capacity));

    let ctx = SessionContext::new(
        registry.clone(),
        scheduler.clone(),
        store,
        statistics,
        gateway,
    );

    schedule_service::start_schedule(&ctx, config.tick_interval).await;
    info!("quiz session node ready");

    shutdown_signal().await;
    info!("shutting down quiz session node");

    schedule_service::stop_schedule(&ctx).await;
    scheduler.abort_all();
    registry.shutdown();
    Ok(())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the node down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
