use anyhow::{bail, Context};
use std::path::PathBuf;
use std::time::Duration;

use crate::context::ReconcileSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Orchestrator runtime settings, read from the environment (`.env` honoured).
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub provider: String,
    pub tick_interval: Duration,
    pub shutdown_grace: Duration,
    pub admin_port: u16,
    pub seed_file: Option<PathBuf>,
    pub reconcile: ReconcileSettings,
}

impl OrchestratorSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let secs = |name: &str, default: u64| -> anyhow::Result<u64> {
            match get(name) {
                Some(raw) => raw.parse::<u64>().with_context(|| {
                    format!("{} must be a number of seconds, got '{}'", name, raw)
                }),
                None => Ok(default),
            }
        };
        let chrono_secs = |name: &str, value: u64| -> anyhow::Result<chrono::Duration> {
            i64::try_from(value)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .with_context(|| format!("{} is out of range: {}", name, value))
        };

        let store = match get("STORE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("unknown STORE '{}' (expected postgres or memory)", other),
        };
        let database_url = get("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            bail!("DATABASE_URL must be set when STORE=postgres");
        }

        let tick_interval = secs("TICK_INTERVAL_SECS", 10)?;
        if tick_interval == 0 {
            bail!("TICK_INTERVAL_SECS must be greater than zero");
        }
        let admin_port = match get("ADMIN_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("ADMIN_PORT must be a port number, got '{}'", raw))?,
            None => 8001,
        };

        let remote_timeout = secs("REMOTE_TIMEOUT_SECS", 30)?;
        let reservation_grace = secs("RESERVATION_GRACE_SECS", 300)?;
        // A batch is connect + create, each bounded by the remote timeout. Its
        // reservations must outlive both or a late answer races their expiry.
        if reservation_grace <= remote_timeout.saturating_mul(2) {
            bail!(
                "RESERVATION_GRACE_SECS ({}) must exceed twice REMOTE_TIMEOUT_SECS ({})",
                reservation_grace,
                remote_timeout
            );
        }

        Ok(Self {
            store,
            database_url,
            redis_url: get("REDIS_URL"),
            provider: get("PROVIDER").unwrap_or_else(|| "mock".to_string()),
            tick_interval: Duration::from_secs(tick_interval),
            shutdown_grace: Duration::from_secs(secs("SHUTDOWN_GRACE_SECS", 15)?),
            admin_port,
            seed_file: get("FLEET_SEED_FILE").map(PathBuf::from),
            reconcile: ReconcileSettings {
                remote_timeout: Duration::from_secs(remote_timeout),
                reservation_grace: chrono_secs("RESERVATION_GRACE_SECS", reservation_grace)?,
                lease_ttl: chrono_secs("LEASE_TTL_SECS", secs("LEASE_TTL_SECS", 120)?)?,
            },
        })
    }
}
