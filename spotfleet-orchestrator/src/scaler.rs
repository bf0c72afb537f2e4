use serde_json::{json, Value};
use spotfleet_common::bus::{Anomaly, FleetEvent, Step};
use spotfleet_common::{FleetError, Instance, InstancePool, InstanceState, PoolConfiguration};
use spotfleet_providers::inventory::{LaunchTemplate, SpotRequest};
use std::collections::BTreeMap;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::FleetContext;
use crate::userdata;

/// What the scaler intends to do for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalePlan {
    Hold,
    Up(usize),
    Down(usize),
}

impl ScalePlan {
    pub fn step(&self) -> Option<Step> {
        match self {
            ScalePlan::Hold => None,
            ScalePlan::Up(_) => Some(Step::ScaleUp),
            ScalePlan::Down(_) => Some(Step::ScaleDown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Hold,
    /// Rows were reserved and a background batch request was spawned.
    Provisioning { count: usize, region: String },
    Terminated { count: usize },
}

/// Rows counted against the target size: reservations plus pending and running instances.
pub fn current_size(tracked: &[Instance]) -> usize {
    tracked
        .iter()
        .filter(|i| i.status.counts_toward_size())
        .count()
}

pub fn plan(config: &PoolConfiguration, tracked: &[Instance]) -> ScalePlan {
    let desired = config.size as i64;
    let current = current_size(tracked) as i64;
    match desired - current {
        0 => ScalePlan::Hold,
        d if d > 0 => ScalePlan::Up(d as usize),
        d => ScalePlan::Down(d.unsigned_abs() as usize),
    }
}

/// Oldest `count` instances that can be terminated by provider id.
/// Reservations without a provider id are never selected.
pub fn select_for_termination(tracked: &[Instance], count: usize) -> Vec<Instance> {
    let mut candidates: Vec<&Instance> = tracked
        .iter()
        .filter(|i| i.provider_instance_id.is_some())
        .filter(|i| matches!(i.status, InstanceState::Pending | InstanceState::Running))
        .collect();
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    candidates.into_iter().take(count).cloned().collect()
}

/// Template keys the provider understands, with raw overrides applied last.
pub fn launch_template(config: &PoolConfiguration) -> LaunchTemplate {
    let mut template = LaunchTemplate::new();
    if let Some(key_name) = &config.image.key_name {
        template.insert("key_name".to_string(), json!(key_name));
    }
    template.insert("image_name".to_string(), json!(config.image.image_name));
    template.insert("instance_type".to_string(), json!(config.image.instance_type));
    template.insert(
        "security_groups".to_string(),
        Value::from(config.image.security_groups.clone()),
    );
    for (key, value) in &config.image.raw {
        template.insert(key.clone(), value.clone());
    }
    template
}

pub async fn execute(
    ctx: &FleetContext,
    pool: &InstancePool,
    config: &PoolConfiguration,
    tracked: &[Instance],
    plan: ScalePlan,
) -> Result<ScaleAction, FleetError> {
    match plan {
        ScalePlan::Hold => {
            info!(pool_id = %pool.id, size = config.size, "[scaler] pool size ok");
            Ok(ScaleAction::Hold)
        }
        ScalePlan::Up(count) => scale_up(ctx, pool, config, tracked, count).await,
        ScalePlan::Down(count) => scale_down(ctx, pool, config, tracked, count).await,
    }
}

async fn scale_up(
    ctx: &FleetContext,
    pool: &InstancePool,
    config: &PoolConfiguration,
    tracked: &[Instance],
    count: usize,
) -> Result<ScaleAction, FleetError> {
    // Local preparation first: a broken configuration must not leave reservations behind.
    let placement = ctx.placement.choose(&config.regions, config)?;
    let userdata = userdata::for_config(config)?;
    let request = SpotRequest {
        template: launch_template(config),
        userdata,
        count,
        zone: placement.zone.clone(),
        max_price: config.max_price,
        tags: config.instance_tags(pool.id),
    };

    let reserved = ctx
        .store
        .reserve_instances(
            pool.id,
            &placement.region,
            placement.zone.as_deref(),
            count,
            ctx.now(),
        )
        .await?;
    info!(
        pool_id = %pool.id,
        count,
        region = placement.region.as_str(),
        "[scaler] pool needs more instances, reserved rows and starting batch"
    );
    ctx.events
        .emit(
            pool.id,
            FleetEvent::PoolScaled {
                delta: count as i64,
                size: current_size(tracked) + count,
            },
        )
        .await;

    let task_ctx = ctx.clone();
    let task_config = config.clone();
    let region = placement.region.clone();
    let pool_id = pool.id;
    ctx.provisioning.spawn(async move {
        provision_batch(task_ctx, pool_id, task_config, region, request, reserved).await;
    });

    Ok(ScaleAction::Provisioning {
        count,
        region: placement.region,
    })
}

/// Background half of a scale-up. Its only handoff to the loop is through the
/// reserved rows: on any failure they stay `requested` for the synchronizer.
async fn provision_batch(
    ctx: FleetContext,
    pool_id: Uuid,
    config: PoolConfiguration,
    region: String,
    request: SpotRequest,
    reserved: Vec<Instance>,
) {
    let launched = async {
        let client = ctx.connect(&config, &region).await?;
        ctx.remote(client.create_batch(&request)).await
    }
    .await;

    let launched = match launched {
        Ok(launched) => launched,
        Err(e) => {
            ctx.events
                .emit(
                    pool_id,
                    FleetEvent::RemoteFailure {
                        step: Step::Provision,
                        error: e.to_string(),
                    },
                )
                .await;
            return;
        }
    };

    if launched.len() != reserved.len() {
        ctx.events
            .emit(
                pool_id,
                FleetEvent::AnomalyDetected {
                    anomaly: Anomaly::BatchSizeMismatch {
                        region,
                        requested: reserved.len(),
                        returned: launched.len(),
                    },
                },
            )
            .await;
        return;
    }

    for (mut instance, created) in reserved.into_iter().zip(launched) {
        let state = InstanceState::from_code(created.state_code);
        instance.provider_instance_id = Some(created.provider_id.clone());
        instance.status = state;
        instance.hostname = created.public_hostname.filter(|h| !h.is_empty());
        match ctx.store.update_reservation(&instance).await {
            Ok(true) => {}
            // The reservation expired (or was replaced) while the batch was in flight.
            Ok(false) => {
                ctx.events
                    .emit(
                        pool_id,
                        FleetEvent::AnomalyDetected {
                            anomaly: Anomaly::UntrackedLiveResource {
                                region: region.clone(),
                                provider_instance_id: created.provider_id,
                                state,
                            },
                        },
                    )
                    .await;
            }
            Err(e) => {
                error!(
                    %pool_id,
                    instance_id = %instance.id,
                    "[scaler] failed to record launched instance: {}",
                    e
                );
            }
        }
    }
    info!(%pool_id, region = region.as_str(), "[scaler] batch launched");
}

async fn scale_down(
    ctx: &FleetContext,
    pool: &InstancePool,
    config: &PoolConfiguration,
    tracked: &[Instance],
    count: usize,
) -> Result<ScaleAction, FleetError> {
    let victims = select_for_termination(tracked, count);
    info!(
        pool_id = %pool.id,
        over = count,
        selected = victims.len(),
        "[scaler] pool over limit, terminating oldest instances"
    );

    let mut by_region: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for victim in &victims {
        if let Some(provider_id) = &victim.provider_instance_id {
            by_region
                .entry(victim.region.as_str())
                .or_default()
                .push(provider_id.clone());
        }
    }

    let mut terminated = 0;
    for (region, ids) in by_region {
        let client = ctx.connect(config, region).await?;
        ctx.remote(client.terminate_batch(&ids)).await?;
        terminated += ids.len();
    }

    ctx.events
        .emit(
            pool.id,
            FleetEvent::PoolScaled {
                delta: -(terminated as i64),
                size: current_size(tracked) - terminated,
            },
        )
        .await;
    Ok(ScaleAction::Terminated { count: terminated })
}
