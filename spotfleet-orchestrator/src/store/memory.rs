use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use spotfleet_common::{FleetError, Instance, InstancePool, PoolConfiguration};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::PoolStore;

#[derive(Default)]
struct Tables {
    configs: HashMap<Uuid, PoolConfiguration>,
    pools: HashMap<Uuid, InstancePool>,
    leases: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
    instances: HashMap<Uuid, Instance>,
}

/// In-process store for tests and `STORE=memory` runs.
///
/// Counts instance-row mutations so callers can check that a pass wrote nothing.
#[derive(Default)]
pub struct MemoryPoolStore {
    tables: Mutex<Tables>,
    instance_writes: AtomicUsize,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, FleetError> {
        self.tables
            .lock()
            .map_err(|_| FleetError::Store("memory store lock poisoned".to_string()))
    }

    /// Number of instance saves and deletes performed so far.
    pub fn instance_writes(&self) -> usize {
        self.instance_writes.load(Ordering::SeqCst)
    }

    fn wrote(&self) {
        self.instance_writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    async fn insert_config(&self, config: &PoolConfiguration) -> Result<(), FleetError> {
        self.tables()?.configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn load_config(&self, config_id: Uuid) -> Result<PoolConfiguration, FleetError> {
        self.tables()?
            .configs
            .get(&config_id)
            .cloned()
            .ok_or(FleetError::ConfigNotFound(config_id))
    }

    async fn insert_pool(&self, pool: &InstancePool) -> Result<(), FleetError> {
        self.tables()?.pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<InstancePool>, FleetError> {
        let mut pools: Vec<InstancePool> = self.tables()?.pools.values().cloned().collect();
        pools.sort_by_key(|p| p.created_at);
        Ok(pools)
    }

    async fn get_pool(&self, pool_id: Uuid) -> Result<InstancePool, FleetError> {
        self.tables()?
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or(FleetError::PoolNotFound(pool_id))
    }

    async fn delete_pool(&self, pool_id: Uuid) -> Result<(), FleetError> {
        let mut tables = self.tables()?;
        tables.pools.remove(&pool_id);
        tables.leases.remove(&pool_id);
        tables.instances.retain(|_, i| i.pool_id != pool_id);
        Ok(())
    }

    async fn set_last_cycled(
        &self,
        pool_id: Uuid,
        last_cycled: Option<DateTime<Utc>>,
    ) -> Result<(), FleetError> {
        let mut tables = self.tables()?;
        let pool = tables
            .pools
            .get_mut(&pool_id)
            .ok_or(FleetError::PoolNotFound(pool_id))?;
        pool.last_cycled = last_cycled;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        pool_id: Uuid,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        let mut tables = self.tables()?;
        if !tables.pools.contains_key(&pool_id) {
            return Err(FleetError::PoolNotFound(pool_id));
        }
        let free = match tables.leases.get(&pool_id) {
            None => true,
            Some((owner, expires_at)) => *owner == holder || *expires_at <= now,
        };
        if free {
            tables.leases.insert(pool_id, (holder, now + ttl));
        }
        Ok(free)
    }

    async fn release_lease(&self, pool_id: Uuid, holder: Uuid) -> Result<(), FleetError> {
        let mut tables = self.tables()?;
        if tables.leases.get(&pool_id).is_some_and(|(owner, _)| *owner == holder) {
            tables.leases.remove(&pool_id);
        }
        Ok(())
    }

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>, FleetError> {
        let mut instances: Vec<Instance> = self
            .tables()?
            .instances
            .values()
            .filter(|i| i.pool_id == pool_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn reserve_instances(
        &self,
        pool_id: Uuid,
        region: &str,
        zone: Option<&str>,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Instance>, FleetError> {
        let mut tables = self.tables()?;
        if !tables.pools.contains_key(&pool_id) {
            return Err(FleetError::PoolNotFound(pool_id));
        }
        let reserved: Vec<Instance> = (0..count)
            .map(|_| Instance::reservation(pool_id, region, zone, now))
            .collect();
        for instance in &reserved {
            tables.instances.insert(instance.id, instance.clone());
            self.wrote();
        }
        Ok(reserved)
    }

    async fn save_instance(&self, instance: &Instance) -> Result<(), FleetError> {
        self.tables()?.instances.insert(instance.id, instance.clone());
        self.wrote();
        Ok(())
    }

    async fn update_reservation(&self, instance: &Instance) -> Result<bool, FleetError> {
        let mut tables = self.tables()?;
        match tables.instances.get_mut(&instance.id) {
            Some(row) if row.is_unconfirmed_reservation() => {
                row.provider_instance_id = instance.provider_instance_id.clone();
                row.hostname = instance.hostname.clone();
                row.status = instance.status;
                self.wrote();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_instance(&self, instance_id: Uuid) -> Result<(), FleetError> {
        if self.tables()?.instances.remove(&instance_id).is_some() {
            self.wrote();
        }
        Ok(())
    }
}
