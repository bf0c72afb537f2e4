use spotfleet_common::bus::{Anomaly, FleetEvent};
use spotfleet_common::{
    FleetError, Instance, InstancePool, InstanceState, PoolConfiguration, POOL_TAG_KEY,
};
use spotfleet_providers::inventory::{DiscoveredInstance, InstanceFilter};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::context::FleetContext;
use crate::store::group_by_region;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    /// Pass forced right after a full pool termination: tracked rows the
    /// provider no longer knows are part of the replaced generation and are purged.
    AfterCycle,
}

#[derive(Debug, Default, Clone)]
pub struct SyncOutcome {
    /// Rows still tracked after the pass (terminal ones are gone).
    pub tracked: Vec<Instance>,
    pub updated: usize,
    pub removed: usize,
    pub anomalies: usize,
}

/// Regions to query: every region with tracked rows plus the configured preferences.
pub fn regions_to_visit(instances: &[Instance], config: &PoolConfiguration) -> BTreeSet<String> {
    instances
        .iter()
        .map(|i| i.region.clone())
        .chain(config.regions.iter().cloned())
        .filter(|r| !r.trim().is_empty())
        .collect()
}

/// Pull provider truth for every region of the pool and fold it into the store.
///
/// Never creates or terminates anything. A failure in any region aborts the
/// whole pass so later stages never act on half-synchronized data.
pub async fn synchronize(
    ctx: &FleetContext,
    pool: &InstancePool,
    config: &PoolConfiguration,
    instances: Vec<Instance>,
    mode: SyncMode,
) -> Result<SyncOutcome, FleetError> {
    let regions = regions_to_visit(&instances, config);
    let mut by_region = group_by_region(instances);
    let mut outcome = SyncOutcome::default();

    for region in regions {
        let tracked = by_region.remove(&region).unwrap_or_default();
        let client = ctx.connect(config, &region).await?;
        let found = ctx
            .remote(client.find(&InstanceFilter::by_tag(POOL_TAG_KEY, &pool.tag_value())))
            .await?;
        sync_region(ctx, pool, &region, tracked, found, mode, &mut outcome).await?;
    }

    debug!(
        pool_id = %pool.id,
        tracked = outcome.tracked.len(),
        updated = outcome.updated,
        removed = outcome.removed,
        anomalies = outcome.anomalies,
        "[synchronizer] pass complete"
    );
    Ok(outcome)
}

async fn sync_region(
    ctx: &FleetContext,
    pool: &InstancePool,
    region: &str,
    tracked: Vec<Instance>,
    found: Vec<DiscoveredInstance>,
    mode: SyncMode,
    outcome: &mut SyncOutcome,
) -> Result<(), FleetError> {
    let remote: HashMap<&str, &DiscoveredInstance> = found
        .iter()
        .map(|d| (d.provider_id.as_str(), d))
        .collect();
    let mut matched: HashSet<&str> = HashSet::new();
    let now = ctx.now();

    for mut instance in tracked {
        match instance.provider_instance_id.clone() {
            None => {
                let expired = instance.status == InstanceState::Requested
                    && now - instance.created_at >= ctx.settings.reservation_grace;
                if expired {
                    ctx.store.delete_instance(instance.id).await?;
                    outcome.removed += 1;
                    ctx.events
                        .emit(
                            pool.id,
                            FleetEvent::ReservationExpired {
                                instance_id: instance.id,
                                region: region.to_string(),
                            },
                        )
                        .await;
                    continue;
                }
            }
            Some(provider_id) => match remote.get(provider_id.as_str()) {
                Some(discovered) => {
                    matched.insert(discovered.provider_id.as_str());
                    if apply_provider_state(&mut instance, discovered) {
                        ctx.store.save_instance(&instance).await?;
                        outcome.updated += 1;
                    }
                }
                None if instance.status.is_terminal() => {}
                None if mode == SyncMode::AfterCycle => {
                    info!(
                        pool_id = %pool.id,
                        instance_id = %instance.id,
                        provider_id = provider_id.as_str(),
                        "[synchronizer] dropping row unknown to provider after pool cycle"
                    );
                    ctx.store.delete_instance(instance.id).await?;
                    outcome.removed += 1;
                    continue;
                }
                None => {
                    outcome.anomalies += 1;
                    ctx.events
                        .emit(
                            pool.id,
                            FleetEvent::AnomalyDetected {
                                anomaly: Anomaly::TrackedResourceMissing {
                                    region: region.to_string(),
                                    instance_id: instance.id,
                                    provider_instance_id: provider_id,
                                },
                            },
                        )
                        .await;
                }
            },
        }

        if instance.status.is_terminal() {
            ctx.store.delete_instance(instance.id).await?;
            outcome.removed += 1;
        } else {
            outcome.tracked.push(instance);
        }
    }

    for discovered in &found {
        if matched.contains(discovered.provider_id.as_str()) {
            continue;
        }
        let state = InstanceState::from_code(discovered.state_code);
        if state.is_terminal() {
            continue;
        }
        outcome.anomalies += 1;
        ctx.events
            .emit(
                pool.id,
                FleetEvent::AnomalyDetected {
                    anomaly: Anomaly::UntrackedLiveResource {
                        region: region.to_string(),
                        provider_instance_id: discovered.provider_id.clone(),
                        state,
                    },
                },
            )
            .await;
    }
    Ok(())
}

/// Copy status and hostname from the provider. Returns true when the row changed.
fn apply_provider_state(instance: &mut Instance, discovered: &DiscoveredInstance) -> bool {
    let mut changed = false;
    let state = InstanceState::from_code(discovered.state_code);
    if instance.status != state {
        instance.status = state;
        changed = true;
    }
    if let Some(hostname) = discovered
        .public_hostname
        .as_deref()
        .filter(|h| !h.is_empty())
    {
        if instance.hostname.as_deref() != Some(hostname) {
            instance.hostname = Some(hostname.to_string());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn discovered(state: InstanceState, hostname: Option<&str>) -> DiscoveredInstance {
        DiscoveredInstance {
            provider_id: "i-1".to_string(),
            state_code: state.code(),
            public_hostname: hostname.map(str::to_string),
            tags: BTreeMap::new(),
        }
    }

    fn tracked(state: InstanceState, hostname: Option<&str>) -> Instance {
        Instance {
            id: Uuid::new_v4(),
            pool_id: Uuid::new_v4(),
            region: "us-east-1".to_string(),
            zone: None,
            provider_instance_id: Some("i-1".to_string()),
            hostname: hostname.map(str::to_string),
            status: state,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn unchanged_state_is_not_a_write() {
        let mut inst = tracked(InstanceState::Running, Some("a.example"));
        assert!(!apply_provider_state(
            &mut inst,
            &discovered(InstanceState::Running, Some("a.example"))
        ));
        // an empty hostname from the provider never clears ours
        assert!(!apply_provider_state(
            &mut inst,
            &discovered(InstanceState::Running, Some(""))
        ));
    }

    #[test]
    fn state_and_hostname_changes_are_applied() {
        let mut inst = tracked(InstanceState::Pending, None);
        assert!(apply_provider_state(
            &mut inst,
            &discovered(InstanceState::Running, Some("b.example"))
        ));
        assert_eq!(inst.status, InstanceState::Running);
        assert_eq!(inst.hostname.as_deref(), Some("b.example"));
    }

    #[test]
    fn visits_tracked_and_preferred_regions() {
        let mut inst = tracked(InstanceState::Running, None);
        inst.region = "eu-west-1".to_string();
        let config = spotfleet_common::PoolConfiguration {
            id: Uuid::new_v4(),
            name: "c".to_string(),
            size: 1,
            cycle_interval_secs: 0,
            max_price: 0.1,
            image: Default::default(),
            tags: BTreeMap::new(),
            credentials: None,
            userdata: None,
            userdata_macros: BTreeMap::new(),
            regions: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            zone: None,
        };
        let regions: Vec<String> = regions_to_visit(&[inst], &config).into_iter().collect();
        assert_eq!(regions, vec!["eu-west-1".to_string(), "us-east-1".to_string()]);
    }
}
