use crate::{inventory, FleetProvider, RegionClient};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use spotfleet_common::{Credentials, InstanceState};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Operations that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    Connect,
    Find,
    Create,
    Terminate,
}

#[derive(Clone, Debug)]
pub struct MockInstance {
    pub provider_id: String,
    pub region: String,
    pub zone: Option<String>,
    pub state: InstanceState,
    pub hostname: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    instances: Vec<MockInstance>,
    next_id: u64,
    failing: HashSet<MockOp>,
    short_batch: Option<usize>,
    latency: Option<Duration>,
    auto_advance: bool,
    create_requests: Vec<(String, inventory::SpotRequest)>,
    terminate_calls: Vec<(String, Vec<String>)>,
}

/// In-memory cloud used for local runs and tests.
///
/// Created instances start `pending`; `advance()` moves every instance one step
/// along pending -> running and shutting-down -> terminated. With auto-advance
/// enabled each `find` call advances the region it queries.
#[derive(Clone, Default)]
pub struct MockFleet {
    state: Arc<Mutex<MockState>>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_advance(self) -> Self {
        self.lock().auto_advance = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail(&self, op: MockOp) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: MockOp) {
        self.lock().failing.remove(&op);
    }

    /// Make `create_batch` return at most `n` instances.
    pub fn set_short_batch(&self, n: Option<usize>) {
        self.lock().short_batch = n;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    pub fn advance(&self) {
        advance_instances(&mut self.lock(), None);
    }

    /// Place a resource directly at the provider, bypassing the orchestrator.
    pub fn inject(
        &self,
        region: &str,
        tags: BTreeMap<String, String>,
        state: InstanceState,
    ) -> String {
        let mut st = self.lock();
        let provider_id = next_provider_id(&mut st);
        st.instances.push(MockInstance {
            provider_id: provider_id.clone(),
            region: region.to_string(),
            zone: None,
            state,
            hostname: Some(format!("{}.{}.mock.internal", provider_id, region)),
            tags,
        });
        provider_id
    }

    pub fn set_state(&self, provider_id: &str, state: InstanceState) {
        let mut st = self.lock();
        if let Some(inst) = st.instances.iter_mut().find(|i| i.provider_id == provider_id) {
            inst.state = state;
        }
    }

    /// Drop the provider-side record entirely, as providers do some time after termination.
    pub fn forget(&self, provider_id: &str) {
        self.lock().instances.retain(|i| i.provider_id != provider_id);
    }

    pub fn instances(&self) -> Vec<MockInstance> {
        self.lock().instances.clone()
    }

    pub fn instance(&self, provider_id: &str) -> Option<MockInstance> {
        self.lock()
            .instances
            .iter()
            .find(|i| i.provider_id == provider_id)
            .cloned()
    }

    /// Non-terminal resources carrying `key=value`.
    pub fn live_with_tag(&self, key: &str, value: &str) -> Vec<MockInstance> {
        self.lock()
            .instances
            .iter()
            .filter(|i| !i.state.is_terminal())
            .filter(|i| i.tags.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect()
    }

    /// Region and instance count of every `create_batch` call, in call order.
    pub fn create_calls(&self) -> Vec<(String, usize)> {
        self.lock()
            .create_requests
            .iter()
            .map(|(region, request)| (region.clone(), request.count))
            .collect()
    }

    /// Full requests as received by `create_batch`.
    pub fn create_requests(&self) -> Vec<(String, inventory::SpotRequest)> {
        self.lock().create_requests.clone()
    }

    pub fn terminate_calls(&self) -> Vec<(String, Vec<String>)> {
        self.lock().terminate_calls.clone()
    }

    fn check(&self, op: MockOp) -> Result<Option<Duration>> {
        let st = self.lock();
        if st.failing.contains(&op) {
            return Err(anyhow!("mock provider: injected {:?} failure", op));
        }
        Ok(st.latency)
    }

    async fn delay(&self, op: MockOp) -> Result<()> {
        if let Some(latency) = self.check(op)? {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

fn next_provider_id(st: &mut MockState) -> String {
    st.next_id += 1;
    format!("i-{:08x}", st.next_id)
}

fn advance_instances(st: &mut MockState, region: Option<&str>) {
    for inst in st.instances.iter_mut() {
        if region.is_some_and(|r| r != inst.region) {
            continue;
        }
        inst.state = match inst.state {
            InstanceState::Pending => InstanceState::Running,
            InstanceState::ShuttingDown => InstanceState::Terminated,
            InstanceState::Stopping => InstanceState::Stopped,
            other => other,
        };
    }
}

#[async_trait]
impl FleetProvider for MockFleet {
    fn code(&self) -> &'static str {
        "mock"
    }

    async fn connect(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RegionClient>> {
        self.delay(MockOp::Connect).await?;
        if credentials.access_key_id.is_empty() {
            return Err(anyhow!("mock provider: empty access key"));
        }
        Ok(Arc::new(MockRegion {
            region: region.to_string(),
            fleet: self.clone(),
        }))
    }
}

pub struct MockRegion {
    region: String,
    fleet: MockFleet,
}

#[async_trait]
impl RegionClient for MockRegion {
    async fn find(
        &self,
        filter: &inventory::InstanceFilter,
    ) -> Result<Vec<inventory::DiscoveredInstance>> {
        self.fleet.delay(MockOp::Find).await?;
        let mut st = self.fleet.lock();
        if st.auto_advance {
            advance_instances(&mut st, Some(&self.region));
        }
        let found = st
            .instances
            .iter()
            .filter(|i| i.region == self.region)
            .filter(|i| match &filter.tag {
                Some((k, v)) => i.tags.get(k) == Some(v),
                None => true,
            })
            .filter(|i| match &filter.ids {
                Some(ids) => ids.contains(&i.provider_id),
                None => true,
            })
            .map(|i| inventory::DiscoveredInstance {
                provider_id: i.provider_id.clone(),
                state_code: i.state.code(),
                public_hostname: i.hostname.clone(),
                tags: i.tags.clone(),
            })
            .collect();
        Ok(found)
    }

    async fn create_batch(
        &self,
        request: &inventory::SpotRequest,
    ) -> Result<Vec<inventory::LaunchedInstance>> {
        self.fleet.delay(MockOp::Create).await?;
        let mut st = self.fleet.lock();
        st.create_requests.push((self.region.clone(), request.clone()));

        let count = st
            .short_batch
            .map(|n| n.min(request.count))
            .unwrap_or(request.count);
        let mut launched = Vec::with_capacity(count);
        for _ in 0..count {
            let provider_id = next_provider_id(&mut st);
            let hostname = format!("{}.{}.mock.internal", provider_id, self.region);
            st.instances.push(MockInstance {
                provider_id: provider_id.clone(),
                region: self.region.clone(),
                zone: request.zone.clone(),
                state: InstanceState::Pending,
                hostname: Some(hostname.clone()),
                tags: request.tags.clone(),
            });
            launched.push(inventory::LaunchedInstance {
                provider_id,
                state_code: InstanceState::Pending.code(),
                public_hostname: Some(hostname),
            });
        }
        Ok(launched)
    }

    async fn terminate_batch(&self, ids: &[String]) -> Result<()> {
        self.fleet.delay(MockOp::Terminate).await?;
        let mut st = self.fleet.lock();
        let region = self.region.clone();
        let unknown: Vec<&String> = ids
            .iter()
            .filter(|id| {
                !st.instances
                    .iter()
                    .any(|i| &i.provider_id == *id && i.region == region)
            })
            .collect();
        if !unknown.is_empty() {
            return Err(anyhow!("mock provider: unknown instance ids {:?}", unknown));
        }
        st.terminate_calls.push((region.clone(), ids.to_vec()));
        for inst in st.instances.iter_mut() {
            if inst.region == region
                && ids.contains(&inst.provider_id)
                && !inst.state.is_terminal()
            {
                inst.state = InstanceState::ShuttingDown;
            }
        }
        Ok(())
    }
}
