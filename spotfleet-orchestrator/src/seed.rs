use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use spotfleet_common::{FleetError, InstancePool, PoolConfiguration};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::store::PoolStore;

/// Start-up fixture: configurations and pools created when absent.
#[derive(Debug, Deserialize)]
pub struct FleetSeed {
    #[serde(default)]
    pub configs: Vec<PoolConfiguration>,
    #[serde(default)]
    pub pools: Vec<SeedPool>,
}

#[derive(Debug, Deserialize)]
pub struct SeedPool {
    pub id: Uuid,
    pub name: String,
    pub config_id: Uuid,
    #[serde(default)]
    pub last_cycled: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub configs_inserted: usize,
    pub pools_inserted: usize,
}

pub fn load(path: &Path) -> anyhow::Result<FleetSeed> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid seed file {}", path.display()))
}

/// Insert the seed's configurations and pools that the store does not know yet.
/// Existing rows are left untouched.
pub async fn apply(
    store: &dyn PoolStore,
    seed: FleetSeed,
    now: DateTime<Utc>,
) -> Result<SeedReport, FleetError> {
    let mut report = SeedReport::default();

    for config in seed.configs {
        match store.load_config(config.id).await {
            Ok(_) => {}
            Err(FleetError::ConfigNotFound(_)) => {
                store.insert_config(&config).await?;
                report.configs_inserted += 1;
            }
            Err(e) => return Err(e),
        }
    }

    for pool in seed.pools {
        match store.get_pool(pool.id).await {
            Ok(_) => continue,
            Err(FleetError::PoolNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match store.load_config(pool.config_id).await {
            Ok(_) => {}
            Err(FleetError::ConfigNotFound(id)) => {
                return Err(FleetError::Config(format!(
                    "seed pool '{}' references unknown configuration {}",
                    pool.name, id
                )))
            }
            Err(e) => return Err(e),
        }
        store
            .insert_pool(&InstancePool {
                id: pool.id,
                name: pool.name,
                config_id: pool.config_id,
                last_cycled: pool.last_cycled,
                created_at: now,
            })
            .await?;
        report.pools_inserted += 1;
    }

    info!(
        configs = report.configs_inserted,
        pools = report.pools_inserted,
        "🌱 fleet seed applied"
    );
    Ok(report)
}
