// Common test utilities and fixtures
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use converge_common::{InstanceRecord, InstanceSpec};
use converge_orchestrator::{ReconcileConfig, Reconciler};
use converge_providers::mock::{MockOp, MockProvider};

pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        stopped_timeout: Duration::from_millis(500),
        running_timeout: Duration::from_millis(500),
        image_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(1),
        retry_interval: Duration::from_millis(2),
        modify_budget: Duration::from_millis(100),
        delete_budget: Duration::from_millis(100),
    }
}

pub fn setup() -> (Arc<MockProvider>, Reconciler) {
    let mock = Arc::new(MockProvider::new().with_settle_polls(2));
    let reconciler = Reconciler::new(mock.clone(), fast_config());
    (mock, reconciler)
}

pub fn small_spec() -> InstanceSpec {
    let mut spec = InstanceSpec::new("ubuntu_22_04_x64", "ecs.n4.small");
    spec.security_group_ids = BTreeSet::from(["sg-web".to_string()]);
    spec.system_disk.size = Some(40);
    spec.instance_name = "web-1".to_string();
    spec
}

pub fn vpc_spec() -> InstanceSpec {
    let mut spec = small_spec();
    spec.network.vswitch_id = Some("vsw-a".to_string());
    spec
}

/// Create `spec` and forget the calls it took.
pub async fn created(
    mock: &MockProvider,
    reconciler: &Reconciler,
    spec: &InstanceSpec,
) -> InstanceRecord {
    let record = reconciler.create(spec).await.expect("create");
    mock.clear_journal().await;
    record
}

/// Position of the first `op` in `calls`.
pub fn position(calls: &[MockOp], op: MockOp) -> usize {
    calls
        .iter()
        .position(|c| *c == op)
        .unwrap_or_else(|| panic!("{:?} not called in {:?}", op, calls))
}
