use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;
use spotfleet_common::bus::{FleetEvent, FleetEventEnvelope, CHANNEL_FLEET_EVENTS};
use sqlx::{Pool, Postgres};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Destination for fleet events besides the process log.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn publish(&self, event: &FleetEventEnvelope) -> anyhow::Result<()>;
}

/// Logs every event through `tracing` and forwards it to the configured sinks.
/// Sink failures are logged and never reach the caller.
pub struct EventBus {
    source: String,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn emit(&self, pool_id: Uuid, event: FleetEvent) {
        log_event(pool_id, &event);
        let envelope = FleetEventEnvelope::new(pool_id, event, &self.source);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&envelope).await {
                warn!(
                    sink = sink.name(),
                    event_id = %envelope.event_id,
                    "failed to publish fleet event: {:#}",
                    e
                );
            }
        }
    }
}

fn log_event(pool_id: Uuid, event: &FleetEvent) {
    match event {
        FleetEvent::AnomalyDetected { anomaly } => {
            warn!(
                %pool_id,
                alert = "anomaly",
                ?anomaly,
                "⚠️  [anomaly] provider and store disagree"
            )
        }
        FleetEvent::RemoteFailure { step, error } => {
            error!(%pool_id, step = step.as_str(), "❌ remote call failed: {}", error)
        }
        FleetEvent::ConfigError { error } => {
            error!(%pool_id, "❌ pool skipped, configuration error: {}", error)
        }
        FleetEvent::PoolCycled { terminated } => {
            info!(%pool_id, terminated, "🔁 pool cycled")
        }
        FleetEvent::PoolScaled { delta, size } => {
            info!(%pool_id, delta, size, "📈 pool scaled")
        }
        FleetEvent::ReservationExpired { instance_id, region } => {
            warn!(
                %pool_id,
                %instance_id,
                region = region.as_str(),
                "reservation expired without provider confirmation"
            )
        }
    }
}

/// Publishes events on the Redis `fleet_events` channel.
pub struct RedisSink {
    client: redis::Client,
}

impl RedisSink {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for RedisSink {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, event: &FleetEventEnvelope) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis (publisher)")?;
        let payload = serde_json::to_string(event)?;
        let _: () = conn.publish(CHANNEL_FLEET_EVENTS, payload).await?;
        Ok(())
    }
}

/// Appends events to the `action_logs` table.
pub struct ActionLogSink {
    db: Pool<Postgres>,
}

impl ActionLogSink {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventSink for ActionLogSink {
    fn name(&self) -> &'static str {
        "action_logs"
    }

    async fn publish(&self, event: &FleetEventEnvelope) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO action_logs (id, action_type, component, pool_id, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.event_id)
        .bind(event.event.type_str())
        .bind(&event.source)
        .bind(event.pool_id)
        .bind(serde_json::to_value(&event.event)?)
        .bind(event.occurred_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Bounded in-memory history, served by the admin endpoint.
pub struct RecentEvents {
    capacity: usize,
    events: Mutex<VecDeque<FleetEventEnvelope>>,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<FleetEventEnvelope> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn for_pool(&self, pool_id: Uuid) -> Vec<FleetEvent> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.pool_id == pool_id)
            .map(|e| e.event)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecentEvents {
    fn name(&self) -> &'static str {
        "recent"
    }

    async fn publish(&self, event: &FleetEventEnvelope) -> anyhow::Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("recent events lock poisoned"))?;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
        Ok(())
    }
}
