use chrono::{DateTime, Utc};
use spotfleet_common::{FleetError, PoolConfiguration};
use spotfleet_providers::{FleetProvider, RegionClient};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::logger::EventBus;
use crate::placement::PlacementPolicy;
use crate::store::PoolStore;

/// Source of "now" for cycle and reservation-age decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Upper bound for every call to the cloud provider.
    pub remote_timeout: Duration,
    /// Age after which an unconfirmed reservation is considered failed.
    pub reservation_grace: chrono::Duration,
    pub lease_ttl: chrono::Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_secs(30),
            reservation_grace: chrono::Duration::seconds(300),
            lease_ttl: chrono::Duration::seconds(120),
        }
    }
}

/// Background provisioning calls spawned by the scaler.
#[derive(Default)]
pub struct ProvisioningTasks {
    set: Mutex<JoinSet<()>>,
}

impl ProvisioningTasks {
    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        // Drop handles of tasks that already finished.
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    pub fn in_flight(&self) -> usize {
        let mut set = self.lock();
        while set.try_join_next().is_some() {}
        set.len()
    }

    /// Wait until every spawned task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let mut set = std::mem::take(&mut *self.lock());
            if set.is_empty() {
                return;
            }
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    tracing::error!("provisioning task failed: {}", e);
                }
            }
        }
    }

    /// Give in-flight tasks `grace` to finish, then abort the rest.
    /// Aborted tasks leave `requested` rows behind; the next run reconciles them.
    pub async fn drain(&self, grace: Duration) {
        let mut set = std::mem::take(&mut *self.lock());
        let finished = tokio::time::timeout(grace, async {
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    tracing::error!("provisioning task failed: {}", e);
                }
            }
        })
        .await;
        if finished.is_err() {
            tracing::warn!(
                "abandoning {} in-flight provisioning task(s) after {:?}",
                set.len(),
                grace
            );
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
    }
}

/// Everything a reconciliation step needs. Cheap to clone into background tasks.
#[derive(Clone)]
pub struct FleetContext {
    pub store: Arc<dyn PoolStore>,
    pub provider: Arc<dyn FleetProvider>,
    pub placement: Arc<dyn PlacementPolicy>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub settings: ReconcileSettings,
    pub provisioning: Arc<ProvisioningTasks>,
    /// Lease holder id of this orchestrator process.
    pub holder_id: Uuid,
}

impl FleetContext {
    pub fn new(
        store: Arc<dyn PoolStore>,
        provider: Arc<dyn FleetProvider>,
        placement: Arc<dyn PlacementPolicy>,
        events: Arc<EventBus>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            provider,
            placement,
            events,
            clock: Arc::new(SystemClock),
            settings,
            provisioning: Arc::new(ProvisioningTasks::default()),
            holder_id: Uuid::new_v4(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run a provider call under the remote timeout, mapping failures to transient errors.
    pub async fn remote<T, F>(&self, call: F) -> Result<T, FleetError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.settings.remote_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(FleetError::remote(e)),
            Err(_) => Err(FleetError::Timeout(self.settings.remote_timeout)),
        }
    }

    pub async fn connect(
        &self,
        config: &PoolConfiguration,
        region: &str,
    ) -> Result<Arc<dyn RegionClient>, FleetError> {
        let credentials = config.credentials.as_ref().ok_or_else(|| {
            FleetError::Config(format!("configuration '{}' has no credentials", config.name))
        })?;
        self.remote(self.provider.connect(region, credentials)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_aborts_tasks_past_grace() {
        let tasks = ProvisioningTasks::default();
        tasks.spawn(async {});
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let started = std::time::Instant::now();
        tasks.drain(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(tasks.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_after_tasks_finish() {
        let tasks = ProvisioningTasks::default();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tasks.spawn(async move {
            let _ = tx.send(());
        });
        tasks.wait_idle().await;
        assert!(rx.await.is_ok());
        assert_eq!(tasks.in_flight(), 0);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
