use anyhow::Context;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use spotfleet_orchestrator::admin::{self, AdminState};
use spotfleet_orchestrator::commands;
use spotfleet_orchestrator::context::FleetContext;
use spotfleet_orchestrator::logger::{ActionLogSink, EventBus, RecentEvents, RedisSink};
use spotfleet_orchestrator::placement::FirstPreferencePlacement;
use spotfleet_orchestrator::provider_manager::ProviderManager;
use spotfleet_orchestrator::reconciliation::ReconciliationLoop;
use spotfleet_orchestrator::seed;
use spotfleet_orchestrator::settings::{OrchestratorSettings, StoreBackend};
use spotfleet_orchestrator::store::{MemoryPoolStore, PgPoolStore, PoolStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = OrchestratorSettings::from_env()?;

    let recent = Arc::new(RecentEvents::new(200));
    let mut events = EventBus::new("spotfleet-orchestrator").with_sink(recent.clone());

    let store: Arc<dyn PoolStore> = match settings.store {
        StoreBackend::Postgres => {
            let url = settings
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set")?;
            let pg = PgPoolStore::connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            // Source of truth is /sqlx-migrations at workspace root
            pg.run_migrations()
                .await
                .context("Failed to run migrations")?;
            info!("✅ Connected to Database");
            events = events.with_sink(Arc::new(ActionLogSink::new(pg.db().clone())));
            Arc::new(pg)
        }
        StoreBackend::Memory => {
            warn!("STORE=memory: fleet state is lost when the process exits");
            Arc::new(MemoryPoolStore::new())
        }
    };

    let redis_client = match &settings.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).context("invalid REDIS_URL")?),
        None => None,
    };
    if let Some(client) = &redis_client {
        events = events.with_sink(Arc::new(RedisSink::new(client.clone())));
    }

    let provider = ProviderManager::get_provider(&settings.provider)
        .with_context(|| format!("provider '{}' is not available", settings.provider))?;
    info!(provider = provider.code(), "☁️  cloud provider ready");

    if let Some(path) = &settings.seed_file {
        let fleet_seed = seed::load(path)?;
        seed::apply(store.as_ref(), fleet_seed, Utc::now())
            .await
            .context("failed to apply fleet seed")?;
    }

    let ctx = FleetContext::new(
        store.clone(),
        provider,
        Arc::new(FirstPreferencePlacement),
        Arc::new(events),
        settings.reconcile.clone(),
    );
    let trigger = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Operator commands (Redis subscriber)
    if let Some(client) = redis_client {
        let store = store.clone();
        let trigger = trigger.clone();
        tokio::spawn(async move {
            if let Err(e) = commands::listen(client, store, trigger).await {
                warn!("command listener stopped: {:#}", e);
            }
        });
    }

    // Admin API (internal health/debug only)
    let app = admin::router(Arc::new(AdminState {
        store,
        recent,
        provisioning: ctx.provisioning.clone(),
    }));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.admin_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin port {}", addr))?;
    info!("Orchestrator listening on {}", addr);
    let mut admin_shutdown = shutdown_rx.clone();
    let admin_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = admin_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let reconciler = ReconciliationLoop::new(ctx, settings.tick_interval, settings.shutdown_grace);
    let loop_task = tokio::spawn(async move { reconciler.run(shutdown_rx, trigger).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 shutdown requested");
    let _ = shutdown_tx.send(true);

    loop_task.await.context("reconciliation loop panicked")?;
    admin_task
        .await
        .context("admin server panicked")?
        .context("admin server failed")?;
    Ok(())
}
