use futures_util::future::join_all;
use spotfleet_common::bus::{FleetEvent, Step};
use spotfleet_common::{ErrorKind, FleetError, InstancePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::FleetContext;
use crate::cycler;
use crate::scaler::{self, ScaleAction};
use crate::synchronizer::{self, SyncMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    /// Rows left tracked after synchronization (and cycling, when it ran).
    pub tracked: usize,
    /// Fresh reservations were outstanding, so cycling and scaling were skipped.
    pub gated: bool,
    pub cycled: bool,
    pub action: ScaleAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Another holder owns the pool lease.
    Busy,
    Reconciled(PoolReport),
    Failed { step: Step, kind: ErrorKind },
    Panicked,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub outcomes: Vec<(Uuid, PoolOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, pool_id: Uuid) -> Option<&PoolOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| *id == pool_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, PoolOutcome::Failed { .. } | PoolOutcome::Panicked))
            .count()
    }
}

struct StepFailure {
    step: Step,
    error: FleetError,
}

fn at(step: Step) -> impl FnOnce(FleetError) -> StepFailure {
    move |error| StepFailure { step, error }
}

/// Run one pool's sequence under its lease: synchronize, then cycle and scale
/// unless fresh reservations are still outstanding.
pub async fn reconcile_pool(ctx: &FleetContext, pool: &InstancePool) -> PoolOutcome {
    match ctx
        .store
        .try_acquire_lease(pool.id, ctx.holder_id, ctx.settings.lease_ttl, ctx.now())
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            debug!(pool_id = %pool.id, "pool lease held elsewhere, skipping");
            return PoolOutcome::Busy;
        }
        Err(e) => return report_failure(ctx, pool.id, at(Step::Synchronize)(e)).await,
    }

    let result = run_sequence(ctx, pool).await;

    if let Err(e) = ctx.store.release_lease(pool.id, ctx.holder_id).await {
        warn!(pool_id = %pool.id, "failed to release pool lease: {}", e);
    }

    match result {
        Ok(report) => PoolOutcome::Reconciled(report),
        Err(failure) => report_failure(ctx, pool.id, failure).await,
    }
}

async fn run_sequence(ctx: &FleetContext, pool: &InstancePool) -> Result<PoolReport, StepFailure> {
    let config = ctx
        .store
        .load_config(pool.config_id)
        .await
        .map_err(at(Step::Synchronize))?;
    config.validate().map_err(at(Step::Synchronize))?;

    let instances = ctx
        .store
        .list_instances(pool.id)
        .await
        .map_err(at(Step::Synchronize))?;
    let mut synced = synchronizer::synchronize(ctx, pool, &config, instances, SyncMode::Normal)
        .await
        .map_err(at(Step::Synchronize))?;

    let now = ctx.now();
    let outstanding = synced
        .tracked
        .iter()
        .filter(|i| i.is_unconfirmed_reservation())
        .filter(|i| now - i.created_at < ctx.settings.reservation_grace)
        .count();
    if outstanding > 0 {
        info!(
            pool_id = %pool.id,
            outstanding,
            "⏳ reservations still awaiting provider confirmation, holding pool"
        );
        return Ok(PoolReport {
            tracked: synced.tracked.len(),
            gated: true,
            cycled: false,
            action: ScaleAction::Hold,
        });
    }

    let mut cycled = false;
    if cycler::is_due(pool, &config, now) {
        synced = cycler::cycle(ctx, pool, &config, synced.tracked)
            .await
            .map_err(at(Step::Cycle))?;
        cycled = true;
    }

    let plan = scaler::plan(&config, &synced.tracked);
    let action = scaler::execute(ctx, pool, &config, &synced.tracked, plan)
        .await
        .map_err(|error| StepFailure {
            step: plan.step().unwrap_or(Step::ScaleUp),
            error,
        })?;

    Ok(PoolReport {
        tracked: synced.tracked.len(),
        gated: false,
        cycled,
        action,
    })
}

async fn report_failure(ctx: &FleetContext, pool_id: Uuid, failure: StepFailure) -> PoolOutcome {
    let kind = failure.error.kind();
    match kind {
        ErrorKind::Transient => {
            ctx.events
                .emit(
                    pool_id,
                    FleetEvent::RemoteFailure {
                        step: failure.step,
                        error: failure.error.to_string(),
                    },
                )
                .await
        }
        ErrorKind::Configuration => {
            ctx.events
                .emit(
                    pool_id,
                    FleetEvent::ConfigError {
                        error: failure.error.to_string(),
                    },
                )
                .await
        }
        ErrorKind::Store => {
            error!(
                %pool_id,
                step = failure.step.as_str(),
                "❌ store failure, pool skipped for this tick: {}",
                failure.error
            );
        }
    }
    PoolOutcome::Failed {
        step: failure.step,
        kind,
    }
}

/// Periodic driver over every pool in the store.
pub struct ReconciliationLoop {
    ctx: FleetContext,
    tick_interval: Duration,
    shutdown_grace: Duration,
}

impl ReconciliationLoop {
    pub fn new(ctx: FleetContext, tick_interval: Duration, shutdown_grace: Duration) -> Self {
        Self {
            ctx,
            tick_interval,
            shutdown_grace,
        }
    }

    pub fn context(&self) -> &FleetContext {
        &self.ctx
    }

    /// Process every pool once. Pools run concurrently, each in its own task,
    /// so neither an error nor a panic in one pool reaches the others.
    pub async fn tick(&self) -> Result<TickReport, FleetError> {
        let pools = self.ctx.store.list_pools().await?;
        let ids: Vec<Uuid> = pools.iter().map(|p| p.id).collect();

        let handles = pools.into_iter().map(|pool| {
            let ctx = self.ctx.clone();
            tokio::spawn(async move { reconcile_pool(&ctx, &pool).await })
        });
        let results = join_all(handles).await;

        let mut report = TickReport::default();
        for (pool_id, result) in ids.into_iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(%pool_id, "❌ pool reconciliation task died: {}", e);
                    PoolOutcome::Panicked
                }
            };
            report.outcomes.push((pool_id, outcome));
        }
        Ok(report)
    }

    /// Tick until `shutdown` flips to true. `trigger` requests an immediate tick.
    /// A tick in progress always completes; in-flight provisioning then gets
    /// the shutdown grace period before being aborted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, trigger: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            holder_id = %self.ctx.holder_id,
            "🔄 reconciliation loop started (every {:?})",
            self.tick_interval
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = trigger.notified() => {
                    info!("📥 immediate reconciliation requested");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            match self.tick().await {
                Ok(report) if report.failures() > 0 => warn!(
                    pools = report.outcomes.len(),
                    failed = report.failures(),
                    "reconciliation tick finished with failures"
                ),
                Ok(report) => debug!(pools = report.outcomes.len(), "reconciliation tick finished"),
                Err(e) => error!("❌ reconciliation tick failed: {}", e),
            }
        }

        info!("🛑 reconciliation loop stopping, draining provisioning tasks");
        self.ctx.provisioning.drain(self.shutdown_grace).await;
    }
}
