#![allow(dead_code)]

mod content;
mod dispatch;
mod engine_config;
mod error;
mod model;
mod observability;
mod rate;
mod servers;
mod store;
mod sync;
#[cfg(test)]
mod testing;
mod transport;
mod util;

use std::{env, sync::Arc, time::Duration};

use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    content::TemplateRenderer,
    dispatch::{DispatchEngine, DispatchFilters, EngineState},
    engine_config::EngineConfig,
    error::EngineError,
    model::CampaignType,
    observability::CycleTracker,
    rate::SendPacer,
    servers::ServerPool,
    store::{memory::SeedData, MemoryStore},
    sync::{EphemeralCache, LockRegistry},
    transport::TransportRouter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let settings = match EngineConfig::load() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            tracing::error!("Cannot load engine configuration: {e}");
            std::process::exit(2);
        }
    };

    let engine = build_engine(settings.clone());
    let filters = filters_from_env();

    if env::var("RUN_ONCE").is_ok_and(|v| v == "true") {
        match engine.run_cycle(&filters).await {
            Ok(summary) => {
                tracing::info!("Single dispatch cycle done: {summary:?}");
                return Ok(());
            }
            Err(EngineError::RunLockBusy) => {
                tracing::error!("Dispatch run lock is held elsewhere");
                std::process::exit(2);
            }
            Err(e) => {
                tracing::error!("Dispatch cycle failed: {e}");
                std::process::exit(2);
            }
        }
    }

    let mut scheduler = JobScheduler::new()
        .await
        .expect("Failed to create scheduler");

    {
        let engine = engine.clone();
        let interval = Duration::from_secs(settings.dispatch.interval_secs);
        scheduler
            .add(Job::new_repeated_async(interval, move |uuid, _l| {
                let engine = engine.clone();
                let filters = filters.clone();
                Box::pin(async move {
                    tracing::debug!("Dispatch job {uuid} starting");
                    match engine.run_cycle(&filters).await {
                        Ok(summary) => {
                            tracing::debug!("Dispatch job {uuid} done: {summary:?}");
                        }
                        Err(EngineError::RunLockBusy) => {
                            tracing::info!("Previous dispatch cycle still running, skipping tick");
                        }
                        Err(e) => {
                            tracing::error!("Dispatch cycle failed: {e}");
                        }
                    }
                })
            })?)
            .await?;
    }

    scheduler.set_shutdown_handler(Box::new(move || {
        Box::pin(async move {
            tracing::info!("Shutting down scheduler");
        })
    }));

    scheduler.start().await?;
    tracing::info!(
        "Campaign delivery engine running, dispatching every {}s",
        settings.dispatch.interval_secs
    );

    shutdown_signal().await;
    tracing::info!("Signal received, restoring in-flight campaigns");
    engine.shutdown().await;
    scheduler.shutdown().await.ok();
    tracing::info!("Cleanups done, shutting down");

    Ok(())
}

fn build_engine(settings: Arc<EngineConfig>) -> DispatchEngine {
    let store = Arc::new(MemoryStore::new());
    let seed = load_seed();
    let delivery_servers = seed.servers.clone();
    store.seed(seed);

    let cache = EphemeralCache::new();
    let locks = LockRegistry::new();
    let pool = Arc::new(ServerPool::new(
        delivery_servers,
        cache.clone(),
        locks.clone(),
        Duration::from_secs(settings.locks.step_ttl_secs),
        Duration::from_millis(settings.locks.step_wait_ms),
    ));

    let state = EngineState {
        store,
        cache,
        locks,
        pool,
        renderer: Arc::new(TemplateRenderer::new(settings.urls.clone())),
        transport: Arc::new(TransportRouter::new()),
        pacer: SendPacer::from_config(&settings.pacer),
        settings,
        tracker: CycleTracker::new(),
    };

    DispatchEngine::new(state)
}

/// Campaigns, customers, subscribers and delivery servers come from the
/// ENGINE_SEED file until a real backend is wired in.
fn load_seed() -> SeedData {
    let Ok(path) = env::var("ENGINE_SEED") else {
        tracing::warn!("ENGINE_SEED is not set, starting with an empty store");
        return SeedData::default();
    };
    match std::fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str::<SeedData>(&raw).map_err(anyhow::Error::from))
    {
        Ok(seed) => {
            tracing::info!(
                "Seeded {} campaigns, {} subscribers, {} servers from {path}",
                seed.campaigns.len(),
                seed.subscribers.len(),
                seed.servers.len()
            );
            seed
        }
        Err(e) => {
            tracing::error!("Failed to load seed file {path}: {e}");
            std::process::exit(2);
        }
    }
}

fn filters_from_env() -> DispatchFilters {
    let ids = |name: &str| -> Vec<i64> {
        env::var(name)
            .unwrap_or_default()
            .split(',')
            .filter_map(|part| part.trim().parse().ok())
            .collect()
    };

    DispatchFilters {
        kind: env::var("ENGINE_CAMPAIGN_TYPE")
            .ok()
            .and_then(|raw| raw.parse::<CampaignType>().ok()),
        customer_ids: ids("ENGINE_CUSTOMER_IDS"),
        exclude_customer_ids: ids("ENGINE_EXCLUDE_CUSTOMER_IDS"),
        campaign_ids: ids("ENGINE_CAMPAIGN_IDS"),
        exclude_campaign_ids: ids("ENGINE_EXCLUDE_CAMPAIGN_IDS"),
        list_ids: ids("ENGINE_LIST_IDS"),
        exclude_list_ids: ids("ENGINE_EXCLUDE_LIST_IDS"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
