use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::InstanceState;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_FLEET_COMMANDS: &str = "fleet_commands";
pub const CHANNEL_FLEET_EVENTS: &str = "fleet_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum FleetCommand {
    /// Run a reconciliation tick now instead of waiting for the interval.
    #[serde(rename = "CMD:RECONCILE")]
    Reconcile,
    /// Forget `last_cycled` so the pool is replaced at its next tick.
    #[serde(rename = "CMD:CYCLE_POOL")]
    CyclePool { pool_id: Uuid },
}

// -----------------------------------------------------------------------------
// Fleet events (EVT:*)
// -----------------------------------------------------------------------------

/// Mismatch between tracked and provider-reported state. Never auto-corrected
/// outside a full pool cycle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Anomaly {
    /// Provider has a live resource tagged for the pool that is not tracked.
    UntrackedLiveResource {
        region: String,
        provider_instance_id: String,
        state: InstanceState,
    },
    /// A tracked instance the provider no longer reports.
    TrackedResourceMissing {
        region: String,
        instance_id: Uuid,
        provider_instance_id: String,
    },
    /// `create_batch` returned a different number of instances than requested.
    BatchSizeMismatch {
        region: String,
        requested: usize,
        returned: usize,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Synchronize,
    Cycle,
    ScaleUp,
    ScaleDown,
    Provision,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Synchronize => "synchronize",
            Step::Cycle => "cycle",
            Step::ScaleUp => "scale_up",
            Step::ScaleDown => "scale_down",
            Step::Provision => "provision",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum FleetEvent {
    #[serde(rename = "EVT:ANOMALY")]
    AnomalyDetected { anomaly: Anomaly },
    #[serde(rename = "EVT:REMOTE_FAILURE")]
    RemoteFailure { step: Step, error: String },
    #[serde(rename = "EVT:CONFIG_ERROR")]
    ConfigError { error: String },
    #[serde(rename = "EVT:POOL_CYCLED")]
    PoolCycled { terminated: usize },
    #[serde(rename = "EVT:POOL_SCALED")]
    PoolScaled { delta: i64, size: usize },
    #[serde(rename = "EVT:RESERVATION_EXPIRED")]
    ReservationExpired { instance_id: Uuid, region: String },
}

impl FleetEvent {
    pub fn type_str(&self) -> &'static str {
        match self {
            FleetEvent::AnomalyDetected { .. } => "EVT:ANOMALY",
            FleetEvent::RemoteFailure { .. } => "EVT:REMOTE_FAILURE",
            FleetEvent::ConfigError { .. } => "EVT:CONFIG_ERROR",
            FleetEvent::PoolCycled { .. } => "EVT:POOL_CYCLED",
            FleetEvent::PoolScaled { .. } => "EVT:POOL_SCALED",
            FleetEvent::ReservationExpired { .. } => "EVT:RESERVATION_EXPIRED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FleetEventEnvelope {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub pool_id: Uuid,
    #[serde(flatten)]
    pub event: FleetEvent,
}

impl FleetEventEnvelope {
    pub fn new(pool_id: Uuid, event: FleetEvent, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source: source.to_string(),
            pool_id,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd: FleetCommand = serde_json::from_str(r#"{"type":"CMD:RECONCILE"}"#).unwrap();
        assert_eq!(cmd, FleetCommand::Reconcile);

        let pool_id = Uuid::new_v4();
        let raw = format!(r#"{{"type":"CMD:CYCLE_POOL","pool_id":"{}"}}"#, pool_id);
        let cmd: FleetCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, FleetCommand::CyclePool { pool_id });
    }

    #[test]
    fn envelope_flattens_event_type() {
        let pool_id = Uuid::new_v4();
        let evt = FleetEventEnvelope::new(
            pool_id,
            FleetEvent::AnomalyDetected {
                anomaly: Anomaly::UntrackedLiveResource {
                    region: "us-east-1".to_string(),
                    provider_instance_id: "i-1".to_string(),
                    state: InstanceState::Running,
                },
            },
            "test",
        );
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value["type"], "EVT:ANOMALY");
        assert_eq!(value["anomaly"]["kind"], "untracked-live-resource");
        assert_eq!(value["anomaly"]["state"], 16);
        assert_eq!(value["pool_id"], pool_id.to_string());
        assert_eq!(evt.event.type_str(), "EVT:ANOMALY");
    }
}
