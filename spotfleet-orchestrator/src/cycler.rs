use chrono::{DateTime, Utc};
use spotfleet_common::bus::FleetEvent;
use spotfleet_common::{
    FleetError, Instance, InstancePool, InstanceState, PoolConfiguration, POOL_TAG_KEY,
};
use spotfleet_providers::inventory::InstanceFilter;
use tracing::info;

use crate::context::FleetContext;
use crate::synchronizer::{self, regions_to_visit, SyncMode, SyncOutcome};

/// A pool is due when cycling is enabled and it was never cycled or the interval elapsed.
pub fn is_due(pool: &InstancePool, config: &PoolConfiguration, now: DateTime<Utc>) -> bool {
    let Some(interval) = config.cycle_interval() else {
        return false;
    };
    match pool.last_cycled {
        None => true,
        Some(last) => now - last >= interval,
    }
}

/// Replace the whole pool: record the cycle, terminate every live resource
/// carrying the pool tag (tracked or not), then resynchronize.
///
/// Returns the post-cycle synchronization so the scaler works from fresh state.
pub async fn cycle(
    ctx: &FleetContext,
    pool: &InstancePool,
    config: &PoolConfiguration,
    tracked: Vec<Instance>,
) -> Result<SyncOutcome, FleetError> {
    let now = ctx.now();
    ctx.store.set_last_cycled(pool.id, Some(now)).await?;
    info!(pool_id = %pool.id, "🔁 [cycler] pool due for cycling, terminating all instances");

    let mut terminated = 0;
    for region in regions_to_visit(&tracked, config) {
        let client = ctx.connect(config, &region).await?;
        let found = ctx
            .remote(client.find(&InstanceFilter::by_tag(POOL_TAG_KEY, &pool.tag_value())))
            .await?;
        let ids: Vec<String> = found
            .into_iter()
            .filter(|d| !InstanceState::from_code(d.state_code).is_terminal())
            .map(|d| d.provider_id)
            .collect();
        if ids.is_empty() {
            continue;
        }
        info!(
            pool_id = %pool.id,
            region = region.as_str(),
            count = ids.len(),
            "[cycler] terminating pool instances"
        );
        ctx.remote(client.terminate_batch(&ids)).await?;
        terminated += ids.len();
    }

    ctx.events
        .emit(pool.id, FleetEvent::PoolCycled { terminated })
        .await;

    let instances = ctx.store.list_instances(pool.id).await?;
    synchronizer::synchronize(ctx, pool, config, instances, SyncMode::AfterCycle).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use spotfleet_common::ImageTemplate;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn pool(last_cycled: Option<DateTime<Utc>>) -> InstancePool {
        InstancePool {
            id: Uuid::new_v4(),
            name: "p".to_string(),
            config_id: Uuid::new_v4(),
            last_cycled,
            created_at: Utc::now(),
        }
    }

    fn config(cycle_interval_secs: u64) -> PoolConfiguration {
        PoolConfiguration {
            id: Uuid::new_v4(),
            name: "c".to_string(),
            size: 1,
            cycle_interval_secs,
            max_price: 0.1,
            image: ImageTemplate::default(),
            tags: BTreeMap::new(),
            credentials: None,
            userdata: None,
            userdata_macros: BTreeMap::new(),
            regions: vec![],
            zone: None,
        }
    }

    #[test]
    fn never_cycled_pool_is_due() {
        assert!(is_due(&pool(None), &config(600), Utc::now()));
    }

    #[test]
    fn due_exactly_at_interval() {
        let now = Utc::now();
        let cfg = config(600);
        assert!(is_due(&pool(Some(now - Duration::seconds(600))), &cfg, now));
        assert!(!is_due(&pool(Some(now - Duration::seconds(599))), &cfg, now));
    }

    #[test]
    fn zero_interval_never_cycles() {
        let now = Utc::now();
        let cfg = config(0);
        assert!(!is_due(&pool(None), &cfg, now));
        assert!(!is_due(&pool(Some(now - Duration::days(365))), &cfg, now));
    }
}
