use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use spotfleet_common::{FleetError, Instance, InstancePool, PoolConfiguration};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryPoolStore;
pub use postgres::PgPoolStore;

/// Durable record of configurations, pools and their instances.
///
/// Every mutation touches a single row. Reads issued by one pool's
/// reconciliation sequence see that sequence's earlier writes.
#[async_trait]
pub trait PoolStore: Send + Sync {
    // Configurations
    async fn insert_config(&self, config: &PoolConfiguration) -> Result<(), FleetError>;
    async fn load_config(&self, config_id: Uuid) -> Result<PoolConfiguration, FleetError>;

    // Pools
    async fn insert_pool(&self, pool: &InstancePool) -> Result<(), FleetError>;
    async fn list_pools(&self) -> Result<Vec<InstancePool>, FleetError>;
    async fn get_pool(&self, pool_id: Uuid) -> Result<InstancePool, FleetError>;
    async fn delete_pool(&self, pool_id: Uuid) -> Result<(), FleetError>;
    async fn set_last_cycled(
        &self,
        pool_id: Uuid,
        last_cycled: Option<DateTime<Utc>>,
    ) -> Result<(), FleetError>;

    /// Claim the pool for `holder` until `now + ttl`. Succeeds when the pool is
    /// unclaimed, the previous lease expired, or `holder` already owns it.
    async fn try_acquire_lease(
        &self,
        pool_id: Uuid,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError>;
    async fn release_lease(&self, pool_id: Uuid, holder: Uuid) -> Result<(), FleetError>;

    // Instances
    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>, FleetError>;
    /// Insert `count` rows in `requested` state for the pool.
    async fn reserve_instances(
        &self,
        pool_id: Uuid,
        region: &str,
        zone: Option<&str>,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Instance>, FleetError>;
    /// Upsert one instance row.
    async fn save_instance(&self, instance: &Instance) -> Result<(), FleetError>;
    /// Confirm a reservation with the provider's answer. Only touches a row that
    /// still exists and is still an unconfirmed `requested` reservation; returns
    /// false when there was no such row (e.g. it expired meanwhile).
    async fn update_reservation(&self, instance: &Instance) -> Result<bool, FleetError>;
    async fn delete_instance(&self, instance_id: Uuid) -> Result<(), FleetError>;

    async fn instances_by_region(
        &self,
        pool_id: Uuid,
    ) -> Result<BTreeMap<String, Vec<Instance>>, FleetError> {
        Ok(group_by_region(self.list_instances(pool_id).await?))
    }
}

pub fn group_by_region(instances: Vec<Instance>) -> BTreeMap<String, Vec<Instance>> {
    let mut grouped: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
    for instance in instances {
        grouped.entry(instance.region.clone()).or_default().push(instance);
    }
    grouped
}
