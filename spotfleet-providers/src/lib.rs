use anyhow::Result;
use async_trait::async_trait;
use spotfleet_common::Credentials;
use std::sync::Arc;

/// Entry point of a cloud fleet backend: hands out region-scoped clients.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// Short provider code (e.g. "mock"), used in logs.
    fn code(&self) -> &'static str;

    async fn connect(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn RegionClient>>;
}

/// Operations against one region of the provider.
#[async_trait]
pub trait RegionClient: Send + Sync {
    /// Enumerate resources matching the filter. An empty filter matches everything.
    async fn find(
        &self,
        filter: &inventory::InstanceFilter,
    ) -> Result<Vec<inventory::DiscoveredInstance>>;

    /// Request `request.count` spot instances in one call.
    /// Implementations must return exactly `count` entries in request order, or an error.
    async fn create_batch(
        &self,
        request: &inventory::SpotRequest,
    ) -> Result<Vec<inventory::LaunchedInstance>>;

    async fn terminate_batch(&self, ids: &[String]) -> Result<()>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, Default)]
    pub struct InstanceFilter {
        pub tag: Option<(String, String)>,
        pub ids: Option<Vec<String>>,
    }

    impl InstanceFilter {
        pub fn by_tag(key: &str, value: &str) -> Self {
            Self {
                tag: Some((key.to_string(), value.to_string())),
                ids: None,
            }
        }

        pub fn by_ids(ids: Vec<String>) -> Self {
            Self {
                tag: None,
                ids: Some(ids),
            }
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DiscoveredInstance {
        pub provider_id: String,
        pub state_code: i32,
        pub public_hostname: Option<String>,
        pub tags: BTreeMap<String, String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct LaunchedInstance {
        pub provider_id: String,
        pub state_code: i32,
        pub public_hostname: Option<String>,
    }

    /// Launch template handed to the provider, keyed the way the provider expects
    /// (`key_name`, `image_name`, `instance_type`, `security_groups`, plus raw overrides).
    pub type LaunchTemplate = serde_json::Map<String, serde_json::Value>;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct SpotRequest {
        pub template: LaunchTemplate,
        pub userdata: Option<String>,
        pub count: usize,
        pub zone: Option<String>,
        pub max_price: f64,
        pub tags: BTreeMap<String, String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
