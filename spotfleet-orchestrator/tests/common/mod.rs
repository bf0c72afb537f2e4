// Common test utilities and fixtures
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use spotfleet_common::bus::{Anomaly, FleetEvent};
use spotfleet_common::{
    Credentials, ImageTemplate, Instance, InstancePool, PoolConfiguration, POOL_TAG_KEY,
};
use spotfleet_orchestrator::context::{FleetContext, ManualClock, ReconcileSettings};
use spotfleet_orchestrator::logger::{EventBus, RecentEvents};
use spotfleet_orchestrator::placement::FirstPreferencePlacement;
use spotfleet_orchestrator::reconciliation::{ReconciliationLoop, TickReport};
use spotfleet_orchestrator::store::{MemoryPoolStore, PoolStore};
use spotfleet_providers::mock::MockFleet;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const REGION: &str = "us-east-1";

/// Memory store + mock cloud + manual clock wired into one reconciliation loop.
pub struct Harness {
    pub store: Arc<MemoryPoolStore>,
    pub fleet: MockFleet,
    pub clock: Arc<ManualClock>,
    pub recent: Arc<RecentEvents>,
    pub ctx: FleetContext,
    pub reconciler: ReconciliationLoop,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ReconcileSettings::default())
    }

    pub fn with_settings(settings: ReconcileSettings) -> Self {
        let store = Arc::new(MemoryPoolStore::new());
        let fleet = MockFleet::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let recent = Arc::new(RecentEvents::new(500));
        let events = EventBus::new("spotfleet-test").with_sink(recent.clone());

        let ctx = FleetContext::new(
            store.clone(),
            Arc::new(fleet.clone()),
            Arc::new(FirstPreferencePlacement),
            Arc::new(events),
            settings,
        )
        .with_clock(clock.clone());
        let reconciler =
            ReconciliationLoop::new(ctx.clone(), Duration::from_secs(10), Duration::from_secs(1));

        Self {
            store,
            fleet,
            clock,
            recent,
            ctx,
            reconciler,
        }
    }

    pub async fn add_pool(&self, config: &PoolConfiguration) -> InstancePool {
        self.store.insert_config(config).await.unwrap();
        let pool = InstancePool {
            id: Uuid::new_v4(),
            name: format!("{}-pool", config.name),
            config_id: config.id,
            last_cycled: None,
            created_at: self.clock_now(),
        };
        self.store.insert_pool(&pool).await.unwrap();
        pool
    }

    /// Overwrite a stored configuration.
    pub async fn update_config(&self, config: &PoolConfiguration) {
        self.store.insert_config(config).await.unwrap();
    }

    /// Run one tick and wait for the provisioning it spawned.
    pub async fn tick(&self) -> TickReport {
        let report = self.reconciler.tick().await.unwrap();
        self.ctx.provisioning.wait_idle().await;
        report
    }

    pub fn advance_clock(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub fn clock_now(&self) -> chrono::DateTime<Utc> {
        use spotfleet_orchestrator::context::Clock;
        self.clock.now()
    }

    pub async fn instances(&self, pool_id: Uuid) -> Vec<Instance> {
        self.store.list_instances(pool_id).await.unwrap()
    }

    pub fn events(&self, pool_id: Uuid) -> Vec<FleetEvent> {
        self.recent.for_pool(pool_id)
    }

    pub fn anomalies(&self, pool_id: Uuid) -> Vec<Anomaly> {
        self.events(pool_id)
            .into_iter()
            .filter_map(|e| match e {
                FleetEvent::AnomalyDetected { anomaly } => Some(anomaly),
                _ => None,
            })
            .collect()
    }

    pub fn pool_tags(pool: &InstancePool) -> BTreeMap<String, String> {
        BTreeMap::from([(POOL_TAG_KEY.to_string(), pool.tag_value())])
    }
}

pub fn config(name: &str, size: u32) -> PoolConfiguration {
    PoolConfiguration {
        id: Uuid::new_v4(),
        name: name.to_string(),
        size,
        cycle_interval_secs: 0,
        max_price: 0.08,
        image: ImageTemplate {
            key_name: Some("fuzzing".to_string()),
            image_name: "fuzz-base".to_string(),
            instance_type: "c5.large".to_string(),
            security_groups: vec!["fuzz-workers".to_string()],
            raw: Default::default(),
        },
        tags: BTreeMap::from([("team".to_string(), "fuzzing".to_string())]),
        credentials: Some(Credentials {
            access_key_id: "AKIATEST".to_string(),
            secret_access_key: "secret".to_string(),
        }),
        userdata: Some("#!/bin/sh\necho @POOL@\n".to_string()),
        userdata_macros: BTreeMap::from([("POOL".to_string(), name.to_string())]),
        regions: vec![REGION.to_string()],
        zone: Some("us-east-1d".to_string()),
    }
}
