use std::env;
use std::sync::Arc;

use converge_providers::RemoteApiClient;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PROVIDER")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "mock".to_string())
    }

    pub fn get_provider(provider_name: &str) -> Option<Arc<dyn RemoteApiClient>> {
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-mock")]
            "mock" => {
                let settle_polls = env::var("MOCK_SETTLE_POLLS")
                    .ok()
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .unwrap_or(1);
                Some(Arc::new(
                    converge_providers::mock::MockProvider::new().with_settle_polls(settle_polls),
                ))
            }
            // Real control-plane clients register here.
            _ => None,
        }
    }
}
