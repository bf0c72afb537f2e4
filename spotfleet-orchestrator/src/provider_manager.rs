use spotfleet_providers::FleetProvider;
use std::sync::Arc;

pub struct ProviderManager;

impl ProviderManager {
    pub fn get_provider(provider_name: &str) -> Option<Arc<dyn FleetProvider>> {
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => Some(Arc::new(
                spotfleet_providers::mock::MockFleet::new().with_auto_advance(),
            )),
            // Real cloud clients plug in here behind their own feature.
            _ => None,
        }
    }
}
