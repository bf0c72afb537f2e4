use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use spotfleet_common::{
    Credentials, FleetError, ImageTemplate, Instance, InstancePool, InstanceState,
    PoolConfiguration,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::PoolStore;

fn store_err(e: sqlx::Error) -> FleetError {
    FleetError::Store(e.to_string())
}

/// Postgres-backed store. Uses runtime-checked queries so no DATABASE_URL is needed at build time.
#[derive(Clone)]
pub struct PgPoolStore {
    db: Pool<Postgres>,
}

impl PgPoolStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str) -> Result<Self, FleetError> {
        let db = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(store_err)?;
        Ok(Self::new(db))
    }

    pub async fn run_migrations(&self) -> Result<(), FleetError> {
        sqlx::migrate!("../sqlx-migrations")
            .run(&self.db)
            .await
            .map_err(|e| FleetError::Store(e.to_string()))
    }

    pub fn db(&self) -> &Pool<Postgres> {
        &self.db
    }
}

fn config_from_row(row: &PgRow) -> Result<PoolConfiguration, sqlx::Error> {
    let size: i32 = row.try_get("size")?;
    let cycle_interval_secs: i64 = row.try_get("cycle_interval_secs")?;
    let image: Json<ImageTemplate> = row.try_get("image")?;
    let tags: Json<BTreeMap<String, String>> = row.try_get("tags")?;
    let credentials: Option<Json<Credentials>> = row.try_get("credentials")?;
    let macros: Json<BTreeMap<String, String>> = row.try_get("userdata_macros")?;
    let regions: Json<Vec<String>> = row.try_get("regions")?;
    Ok(PoolConfiguration {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        size: size.max(0) as u32,
        cycle_interval_secs: cycle_interval_secs.max(0) as u64,
        max_price: row.try_get("max_price")?,
        image: image.0,
        tags: tags.0,
        credentials: credentials.map(|c| c.0),
        userdata: row.try_get("userdata")?,
        userdata_macros: macros.0,
        regions: regions.0,
        zone: row.try_get("zone")?,
    })
}

fn pool_from_row(row: &PgRow) -> Result<InstancePool, sqlx::Error> {
    Ok(InstancePool {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        config_id: row.try_get("config_id")?,
        last_cycled: row.try_get("last_cycled")?,
        created_at: row.try_get("created_at")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<Instance, sqlx::Error> {
    let status_code: i32 = row.try_get("status_code")?;
    Ok(Instance {
        id: row.try_get("id")?,
        pool_id: row.try_get("pool_id")?,
        region: row.try_get("region")?,
        zone: row.try_get("zone")?,
        provider_instance_id: row.try_get("provider_instance_id")?,
        hostname: row.try_get("hostname")?,
        status: InstanceState::from_code(status_code),
        created_at: row.try_get("created_at")?,
    })
}

const INSTANCE_COLUMNS: &str =
    "id, pool_id, region, zone, provider_instance_id, hostname, status_code, created_at";

#[async_trait]
impl PoolStore for PgPoolStore {
    async fn insert_config(&self, config: &PoolConfiguration) -> Result<(), FleetError> {
        sqlx::query(
            r#"
            INSERT INTO pool_configurations
              (id, name, size, cycle_interval_secs, max_price, image, tags, credentials,
               userdata, userdata_macros, regions, zone)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
              name = EXCLUDED.name,
              size = EXCLUDED.size,
              cycle_interval_secs = EXCLUDED.cycle_interval_secs,
              max_price = EXCLUDED.max_price,
              image = EXCLUDED.image,
              tags = EXCLUDED.tags,
              credentials = EXCLUDED.credentials,
              userdata = EXCLUDED.userdata,
              userdata_macros = EXCLUDED.userdata_macros,
              regions = EXCLUDED.regions,
              zone = EXCLUDED.zone
            "#,
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(i32::try_from(config.size).unwrap_or(i32::MAX))
        .bind(i64::try_from(config.cycle_interval_secs).unwrap_or(i64::MAX))
        .bind(config.max_price)
        .bind(Json(&config.image))
        .bind(Json(&config.tags))
        .bind(config.credentials.as_ref().map(Json))
        .bind(config.userdata.as_deref())
        .bind(Json(&config.userdata_macros))
        .bind(Json(&config.regions))
        .bind(config.zone.as_deref())
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn load_config(&self, config_id: Uuid) -> Result<PoolConfiguration, FleetError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, size, cycle_interval_secs, max_price, image, tags, credentials,
                   userdata, userdata_macros, regions, zone
            FROM pool_configurations
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .fetch_optional(&self.db)
        .await
        .map_err(store_err)?
        .ok_or(FleetError::ConfigNotFound(config_id))?;

        // A row that no longer decodes is a configuration problem, not a store outage.
        config_from_row(&row).map_err(|e| FleetError::Config(e.to_string()))
    }

    async fn insert_pool(&self, pool: &InstancePool) -> Result<(), FleetError> {
        sqlx::query(
            "INSERT INTO instance_pools (id, name, config_id, last_cycled, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, config_id = EXCLUDED.config_id",
        )
        .bind(pool.id)
        .bind(&pool.name)
        .bind(pool.config_id)
        .bind(pool.last_cycled)
        .bind(pool.created_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<InstancePool>, FleetError> {
        let rows = sqlx::query(
            "SELECT id, name, config_id, last_cycled, created_at
             FROM instance_pools
             ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(pool_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    async fn get_pool(&self, pool_id: Uuid) -> Result<InstancePool, FleetError> {
        let row = sqlx::query(
            "SELECT id, name, config_id, last_cycled, created_at FROM instance_pools WHERE id = $1",
        )
        .bind(pool_id)
        .fetch_optional(&self.db)
        .await
        .map_err(store_err)?
        .ok_or(FleetError::PoolNotFound(pool_id))?;
        pool_from_row(&row).map_err(store_err)
    }

    async fn delete_pool(&self, pool_id: Uuid) -> Result<(), FleetError> {
        sqlx::query("DELETE FROM instance_pools WHERE id = $1")
            .bind(pool_id)
            .execute(&self.db)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_last_cycled(
        &self,
        pool_id: Uuid,
        last_cycled: Option<DateTime<Utc>>,
    ) -> Result<(), FleetError> {
        let res = sqlx::query("UPDATE instance_pools SET last_cycled = $2 WHERE id = $1")
            .bind(pool_id)
            .bind(last_cycled)
            .execute(&self.db)
            .await
            .map_err(store_err)?;
        if res.rows_affected() == 0 {
            return Err(FleetError::PoolNotFound(pool_id));
        }
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        pool_id: Uuid,
        holder: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        let res = sqlx::query(
            r#"
            UPDATE instance_pools
            SET lease_holder = $2,
                lease_expires_at = $3
            WHERE id = $1
              AND (lease_holder IS NULL OR lease_holder = $2 OR lease_expires_at <= $4)
            "#,
        )
        .bind(pool_id)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn release_lease(&self, pool_id: Uuid, holder: Uuid) -> Result<(), FleetError> {
        sqlx::query(
            "UPDATE instance_pools
             SET lease_holder = NULL, lease_expires_at = NULL
             WHERE id = $1 AND lease_holder = $2",
        )
        .bind(pool_id)
        .bind(holder)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_instances(&self, pool_id: Uuid) -> Result<Vec<Instance>, FleetError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE pool_id = $1 ORDER BY created_at, id",
            INSTANCE_COLUMNS
        ))
        .bind(pool_id)
        .fetch_all(&self.db)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    async fn reserve_instances(
        &self,
        pool_id: Uuid,
        region: &str,
        zone: Option<&str>,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Instance>, FleetError> {
        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            let instance = Instance::reservation(pool_id, region, zone, now);
            self.save_instance(&instance).await?;
            reserved.push(instance);
        }
        Ok(reserved)
    }

    async fn save_instance(&self, instance: &Instance) -> Result<(), FleetError> {
        sqlx::query(
            r#"
            INSERT INTO instances
              (id, pool_id, region, zone, provider_instance_id, hostname, status_code,
               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (id) DO UPDATE SET
              region = EXCLUDED.region,
              zone = EXCLUDED.zone,
              provider_instance_id = EXCLUDED.provider_instance_id,
              hostname = EXCLUDED.hostname,
              status_code = EXCLUDED.status_code,
              updated_at = NOW()
            "#,
        )
        .bind(instance.id)
        .bind(instance.pool_id)
        .bind(&instance.region)
        .bind(instance.zone.as_deref())
        .bind(instance.provider_instance_id.as_deref())
        .bind(instance.hostname.as_deref())
        .bind(instance.status.code())
        .bind(instance.created_at)
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update_reservation(&self, instance: &Instance) -> Result<bool, FleetError> {
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET provider_instance_id = $2,
                hostname = $3,
                status_code = $4,
                updated_at = NOW()
            WHERE id = $1
              AND status_code = -1
              AND provider_instance_id IS NULL
            "#,
        )
        .bind(instance.id)
        .bind(instance.provider_instance_id.as_deref())
        .bind(instance.hostname.as_deref())
        .bind(instance.status.code())
        .execute(&self.db)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_instance(&self, instance_id: Uuid) -> Result<(), FleetError> {
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(instance_id)
            .execute(&self.db)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
