// Integration tests for the Update workflow
mod common;

use std::collections::BTreeSet;

use common::{created, position, setup, small_spec, vpc_spec};
use converge_common::{InstanceChargeType, InstanceStatus, InternetChargeType};
use converge_orchestrator::{Phase, ReconcileError, Rule};
use converge_providers::mock::MockOp;
use converge_providers::{ApiError, RemoteApiClient};

#[tokio::test]
async fn converged_instance_makes_no_mutations() {
    let (mock, reconciler) = setup();
    let spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert!(mock.mutations().await.is_empty());
    assert_eq!(updated.state.status, InstanceStatus::Running);
}

#[tokio::test]
async fn tag_only_change_does_not_reboot() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.tags.insert("env".to_string(), "old".to_string());
    spec.tags.insert("stale".to_string(), "x".to_string());
    let record = created(&mock, &reconciler, &spec).await;

    spec.tags.clear();
    spec.tags.insert("env".to_string(), "new".to_string());
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(updated.state.tags, spec.tags);
    assert_eq!(
        mock.mutations().await,
        vec![MockOp::RemoveTags, MockOp::AddTags]
    );
}

#[tokio::test]
async fn image_and_type_share_one_stop_start_cycle() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.image_id = "centos_8_x64".to_string();
    spec.instance_type = "ecs.n4.large".to_string();
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![
            MockOp::Stop,
            MockOp::ReplaceSystemDisk,
            MockOp::ModifyInstanceType,
            MockOp::Start
        ]
    );
    assert_eq!(updated.state.image_id, "centos_8_x64");
    assert_eq!(updated.state.instance_type, "ecs.n4.large");
    assert_eq!(updated.state.status, InstanceStatus::Running);
}

#[tokio::test]
async fn every_reboot_class_change_in_one_cycle() {
    let (mock, reconciler) = setup();
    let mut spec = vpc_spec();
    spec.password = Some("First123!".to_string());
    let record = created(&mock, &reconciler, &spec).await;

    spec.image_id = "debian_12_x64".to_string();
    spec.system_disk.size = Some(60);
    spec.network.vswitch_id = Some("vsw-b".to_string());
    spec.network.private_ip = Some("172.16.9.9".to_string());
    spec.password = Some("Second123!".to_string());
    spec.instance_type = "ecs.n4.xlarge".to_string();
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![
            MockOp::Stop,
            MockOp::ReplaceSystemDisk,
            MockOp::ModifyVpcAttribute,
            MockOp::ModifyAttributes,
            MockOp::ModifyInstanceType,
            MockOp::Start
        ]
    );
    assert_eq!(updated.state.system_disk.size, 60);
    assert_eq!(updated.state.vswitch_id, "vsw-b");
    assert_eq!(updated.state.private_ip.as_deref(), Some("172.16.9.9"));
    assert_eq!(mock.password(record.instance_id()).await.as_deref(), Some("Second123!"));
    assert_eq!(updated.password.as_deref(), Some("Second123!"));
}

#[tokio::test]
async fn stopped_instance_is_not_stopped_again() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    // Bring it down out of band.
    mock.stop_instance(record.instance_id(), true).await.unwrap();
    mock.clear_journal().await;

    spec.instance_type = "ecs.n4.large".to_string();
    reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![MockOp::ModifyInstanceType, MockOp::Start]
    );
}

#[tokio::test]
async fn disk_size_alone_is_refused_without_mutation() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.system_disk.size = Some(80);
    spec.tags.insert("env".to_string(), "prod".to_string());
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert!(matches!(err, ReconcileError::BusinessRule(_)));
    assert_eq!(err.violation().map(|v| v.rule), Some(Rule::DiskSizeOnlyChange));
    assert!(mock.mutations().await.is_empty());
}

#[tokio::test]
async fn prepaid_cannot_go_back_to_postpaid() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.billing.charge_type = InstanceChargeType::PrePaid;
    let record = created(&mock, &reconciler, &spec).await;

    spec.billing.charge_type = InstanceChargeType::PostPaid;
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert_eq!(err.violation().map(|v| v.rule), Some(Rule::ChargeTypeRegression));
    assert!(mock.mutations().await.is_empty());
}

#[tokio::test]
async fn prepaid_type_change_is_refused() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.billing.charge_type = InstanceChargeType::PrePaid;
    let record = created(&mock, &reconciler, &spec).await;

    spec.instance_type = "ecs.n4.large".to_string();
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert_eq!(err.violation().map(|v| v.rule), Some(Rule::TypeChangeWhilePrepaid));
    assert!(mock.mutations().await.is_empty());
}

#[tokio::test]
async fn leaving_vswitch_without_target_is_invalid() {
    let (mock, reconciler) = setup();
    let mut spec = vpc_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.network.vswitch_id = None;
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    assert!(mock.mutations().await.is_empty());
}

#[tokio::test]
async fn bandwidth_from_zero_allocates_once_after_network_change() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.network.bandwidth_out = 10;
    spec.network.internet_charge_type = InternetChargeType::PayByBandwidth;
    let updated = reconciler.update(&record, &spec).await.unwrap();

    let calls = mock.mutations().await;
    assert_eq!(calls, vec![MockOp::ModifyNetworkSpec, MockOp::AllocatePublicIp]);
    assert!(position(&calls, MockOp::ModifyNetworkSpec) < position(&calls, MockOp::AllocatePublicIp));
    assert_eq!(updated.state.bandwidth_out, 10);
    assert!(updated.state.public_ip.is_some());
}

#[tokio::test]
async fn bandwidth_increase_does_not_allocate() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.network.bandwidth_out = 5;
    let record = created(&mock, &reconciler, &spec).await;

    spec.network.bandwidth_out = 20;
    reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.mutations().await, vec![MockOp::ModifyNetworkSpec]);
}

#[tokio::test]
async fn throttled_type_change_is_retried() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_faults(MockOp::ModifyInstanceType, ApiError::throttled(), 2)
        .await;

    spec.instance_type = "ecs.n4.large".to_string();
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.count(MockOp::ModifyInstanceType).await, 3);
    assert_eq!(mock.count(MockOp::Stop).await, 1);
    assert_eq!(mock.count(MockOp::Start).await, 1);
    assert_eq!(updated.state.instance_type, "ecs.n4.large");
}

#[tokio::test]
async fn type_change_gives_up_when_throttling_persists() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_faults(MockOp::ModifyInstanceType, ApiError::throttled(), 1000)
        .await;

    spec.instance_type = "ecs.n4.large".to_string();
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Timeout { .. }));
    assert_eq!(mock.count(MockOp::Start).await, 0);
}

#[tokio::test]
async fn internal_error_on_network_spec_is_retried() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.network.bandwidth_out = 5;
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(MockOp::ModifyNetworkSpec, ApiError::internal())
        .await;

    spec.network.bandwidth_out = 8;
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.count(MockOp::ModifyNetworkSpec).await, 2);
    assert_eq!(updated.state.bandwidth_out, 8);
}

#[tokio::test]
async fn fatal_error_stops_the_pass() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(
        MockOp::ModifyInstanceType,
        ApiError::new("InvalidInstanceType.NotSupported", "unknown type"),
    )
    .await;

    spec.instance_type = "ecs.bogus".to_string();
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Remote { .. }));
    assert!(err.to_string().contains("InvalidInstanceType.NotSupported"));
    assert_eq!(mock.count(MockOp::ModifyInstanceType).await, 1);
}

#[tokio::test]
async fn security_groups_join_then_leave() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.security_group_ids = BTreeSet::from(["sg-api".to_string()]);
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![MockOp::JoinSecurityGroups, MockOp::LeaveSecurityGroups]
    );
    assert_eq!(updated.state.security_group_ids, spec.security_group_ids);
}

#[tokio::test]
async fn live_attributes_change_without_reboot() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.instance_name = "web-renamed".to_string();
    spec.description = Some("renamed".to_string());
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.mutations().await, vec![MockOp::ModifyAttributes]);
    assert_eq!(updated.state.instance_name, "web-renamed");
    assert_eq!(updated.state.description, "renamed");
}

#[tokio::test]
async fn postpaid_converts_to_prepaid() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.billing.charge_type = InstanceChargeType::PrePaid;
    spec.billing.period = 6;
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.mutations().await, vec![MockOp::ModifyChargeType]);
    assert_eq!(updated.state.charge_type, InstanceChargeType::PrePaid);
    assert_eq!(updated.declared_charge_type, InstanceChargeType::PrePaid);
}

#[tokio::test]
async fn role_read_back_survives_malformed_response() {
    let (mock, reconciler) = setup();
    let mut spec = vpc_spec();
    spec.role_name = Some("ecs-ops".to_string());
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(
        MockOp::DescribeRoleAttachment,
        ApiError::new("UnexpectedJson", "invalid character '<' looking for beginning of value"),
    )
    .await;

    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(updated.state.role_name.as_deref(), Some("ecs-ops"));
    assert!(mock.mutations().await.is_empty());
}

#[tokio::test]
async fn reconcile_with_baseline_updates_in_place() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;

    spec.tags.insert("owner".to_string(), "platform".to_string());
    let updated = reconciler.reconcile(&spec, Some(&record)).await.unwrap();

    assert_eq!(updated.instance_id(), record.instance_id());
    assert_eq!(mock.count(MockOp::Create).await, 0);
    assert_eq!(updated.state.tags.get("owner").map(String::as_str), Some("platform"));
}

#[tokio::test]
async fn transient_tag_read_failure_is_retried_before_diffing() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.tags.insert("env".to_string(), "old".to_string());
    spec.tags.insert("stale".to_string(), "x".to_string());
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(MockOp::GetTags, ApiError::internal()).await;

    spec.tags.remove("stale");
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(mock.count(MockOp::RemoveTags).await, 1);
    assert_eq!(mock.count(MockOp::AddTags).await, 0);
    assert_eq!(mock.snapshot(record.instance_id()).await.unwrap().tags, spec.tags);
    assert_eq!(updated.state.tags, spec.tags);
}

#[tokio::test]
async fn failing_tag_read_aborts_update_without_mutation() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.tags.insert("stale".to_string(), "x".to_string());
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(MockOp::GetTags, ApiError::new("Forbidden.RAM", "not authorized"))
        .await;

    spec.tags.clear();
    let err = reconciler.update(&record, &spec).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Remote { phase: Phase::Tags, .. }));
    assert!(mock.mutations().await.is_empty());
    assert!(mock
        .snapshot(record.instance_id())
        .await
        .unwrap()
        .tags
        .contains_key("stale"));
}

#[tokio::test]
async fn read_tolerates_tag_failure() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    spec.tags.insert("env".to_string(), "prod".to_string());
    let record = created(&mock, &reconciler, &spec).await;
    mock.inject_fault(MockOp::GetTags, ApiError::new("Forbidden.RAM", "not authorized"))
        .await;

    let state = reconciler.read(record.instance_id()).await.unwrap().unwrap();

    assert!(state.tags.is_empty());
    assert_eq!(state.status, InstanceStatus::Running);
}

#[tokio::test]
async fn starting_instance_is_stopped_once_running() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    let mut state = mock.snapshot(record.instance_id()).await.unwrap();
    state.status = InstanceStatus::Starting;
    mock.seed_instance(state).await;

    spec.instance_type = "ecs.n4.large".to_string();
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![MockOp::Stop, MockOp::ModifyInstanceType, MockOp::Start]
    );
    assert_eq!(updated.state.status, InstanceStatus::Running);
    assert_eq!(updated.state.instance_type, "ecs.n4.large");
}

#[tokio::test]
async fn stopping_instance_is_not_stopped_again() {
    let (mock, reconciler) = setup();
    let mut spec = small_spec();
    let record = created(&mock, &reconciler, &spec).await;
    let mut state = mock.snapshot(record.instance_id()).await.unwrap();
    state.status = InstanceStatus::Stopping;
    mock.seed_instance(state).await;

    spec.instance_type = "ecs.n4.large".to_string();
    let updated = reconciler.update(&record, &spec).await.unwrap();

    assert_eq!(
        mock.mutations().await,
        vec![MockOp::ModifyInstanceType, MockOp::Start]
    );
    assert_eq!(updated.state.status, InstanceStatus::Running);
}
