use std::env;
use std::time::Duration;

use crate::provider_manager::ProviderManager;
use crate::reconciler::ReconcileConfig;

/// Runtime settings read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: String,
    pub reconcile: ReconcileConfig,
    /// Whole-run deadline; the pass is cancelled when it expires.
    pub deadline: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = ReconcileConfig::default();
        Self {
            provider: ProviderManager::current_provider_name(),
            reconcile: ReconcileConfig {
                stopped_timeout: secs_var("RECONCILE_STOPPED_TIMEOUT_SECS", defaults.stopped_timeout),
                running_timeout: secs_var("RECONCILE_RUNNING_TIMEOUT_SECS", defaults.running_timeout),
                image_timeout: secs_var("RECONCILE_IMAGE_TIMEOUT_SECS", defaults.image_timeout),
                poll_interval: secs_var("RECONCILE_POLL_INTERVAL_SECS", defaults.poll_interval),
                retry_interval: secs_var("RECONCILE_RETRY_INTERVAL_SECS", defaults.retry_interval),
                modify_budget: secs_var("RECONCILE_MODIFY_BUDGET_SECS", defaults.modify_budget),
                delete_budget: secs_var("RECONCILE_DELETE_BUDGET_SECS", defaults.delete_budget),
            },
            deadline: parse_secs(env::var("RECONCILE_DEADLINE_SECS").ok().as_deref()),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        self.reconcile.clone()
    }
}

fn secs_var(name: &str, default: Duration) -> Duration {
    parse_secs(env::var(name).ok().as_deref()).unwrap_or(default)
}

/// Positive whole seconds; anything else is ignored.
fn parse_secs(raw: Option<&str>) -> Option<Duration> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
}
