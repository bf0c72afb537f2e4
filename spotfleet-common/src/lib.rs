use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod bus;
pub mod error;

pub use error::{ErrorKind, FleetError};

/// Tag attached to every provider resource created for a pool.
pub const POOL_TAG_KEY: &str = "SpotFleet-PoolId";

// --- Enums ---

/// Instance status code. Provider codes follow the EC2 numeric convention;
/// `Requested` only ever exists locally (reservation before the provider answered).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(from = "i32", into = "i32")]
pub enum InstanceState {
    Requested,
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown(i32),
}

impl InstanceState {
    pub const REQUESTED_CODE: i32 = -1;

    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => InstanceState::Requested,
            0 => InstanceState::Pending,
            16 => InstanceState::Running,
            32 => InstanceState::ShuttingDown,
            48 => InstanceState::Terminated,
            64 => InstanceState::Stopping,
            80 => InstanceState::Stopped,
            other => InstanceState::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            InstanceState::Requested => Self::REQUESTED_CODE,
            InstanceState::Pending => 0,
            InstanceState::Running => 16,
            InstanceState::ShuttingDown => 32,
            InstanceState::Terminated => 48,
            InstanceState::Stopping => 64,
            InstanceState::Stopped => 80,
            InstanceState::Unknown(code) => *code,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown(_) => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }

    /// States counted against the pool's target size.
    pub fn counts_toward_size(&self) -> bool {
        matches!(
            self,
            InstanceState::Requested | InstanceState::Pending | InstanceState::Running
        )
    }
}

impl From<i32> for InstanceState {
    fn from(code: i32) -> Self {
        InstanceState::from_code(code)
    }
}

impl From<InstanceState> for i32 {
    fn from(state: InstanceState) -> Self {
        state.code()
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Unknown(code) => write!(f, "unknown({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

// --- Configuration ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Image parameters copied into the provider launch template.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ImageTemplate {
    pub key_name: Option<String>,
    pub image_name: String,
    pub instance_type: String,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// Provider-specific keys merged over the fields above.
    #[serde(default)]
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// Flattened pool configuration. Inheritance is resolved before it gets here.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PoolConfiguration {
    pub id: Uuid,
    pub name: String,
    pub size: u32,
    /// Seconds after which the pool is fully replaced; 0 disables cycling.
    pub cycle_interval_secs: u64,
    pub max_price: f64,
    pub image: ImageTemplate,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub credentials: Option<Credentials>,
    pub userdata: Option<String>,
    #[serde(default)]
    pub userdata_macros: BTreeMap<String, String>,
    /// Ordered region preferences handed to the placement policy.
    #[serde(default)]
    pub regions: Vec<String>,
    pub zone: Option<String>,
}

impl PoolConfiguration {
    pub fn cycle_interval(&self) -> Option<Duration> {
        if self.cycle_interval_secs == 0 {
            return None;
        }
        i64::try_from(self.cycle_interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.credentials.is_none() {
            return Err(FleetError::Config(format!(
                "configuration '{}' has no credentials",
                self.name
            )));
        }
        if self.image.image_name.trim().is_empty() {
            return Err(FleetError::Config(format!(
                "configuration '{}' has no image name",
                self.name
            )));
        }
        if self.image.instance_type.trim().is_empty() {
            return Err(FleetError::Config(format!(
                "configuration '{}' has no instance type",
                self.name
            )));
        }
        if !(self.max_price > 0.0) {
            return Err(FleetError::Config(format!(
                "configuration '{}' has invalid max price {}",
                self.name, self.max_price
            )));
        }
        if self.regions.is_empty() {
            return Err(FleetError::Config(format!(
                "configuration '{}' has no region preference",
                self.name
            )));
        }
        Ok(())
    }

    /// Tags for instances created for `pool_id`; the pool tag always wins.
    pub fn instance_tags(&self, pool_id: Uuid) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(POOL_TAG_KEY.to_string(), pool_id.to_string());
        tags
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstancePool {
    pub id: Uuid,
    pub name: String,
    pub config_id: Uuid,
    pub last_cycled: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InstancePool {
    pub fn tag_value(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub region: String,
    pub zone: Option<String>,
    pub provider_instance_id: Option<String>,
    pub hostname: Option<String>,
    pub status: InstanceState,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    /// A fresh reservation row, written before the provider is asked for anything.
    pub fn reservation(
        pool_id: Uuid,
        region: &str,
        zone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool_id,
            region: region.to_string(),
            zone: zone.map(str::to_string),
            provider_instance_id: None,
            hostname: None,
            status: InstanceState::Requested,
            created_at: now,
        }
    }

    pub fn is_unconfirmed_reservation(&self) -> bool {
        self.status == InstanceState::Requested && self.provider_instance_id.is_none()
    }
}
