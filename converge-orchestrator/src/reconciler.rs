use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_common::{InstanceRecord, InstanceSpec, InstanceState, InstanceStatus, TagSet};
use converge_providers::{classify_error, AttributeChange, ErrorClass, RemoteApiClient};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::change_set::{ChangeKind, ChangeSet};
use crate::error::{Phase, ReconcileError};
use crate::lifecycle_guard;
use crate::logger;
use crate::retry::{self, RetryExecutor, RetryPolicy};
use crate::state_machine::StateWaiter;

/// Timings for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Wait for Stopped (after create, before reboot-class changes, before delete).
    pub stopped_timeout: Duration,
    /// Wait for Running after a start.
    pub running_timeout: Duration,
    /// Wait for a replaced system disk to report the new image.
    pub image_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_interval: Duration,
    /// Budget for retried modify calls (instance type, network spec, charge type, role read-back).
    pub modify_budget: Duration,
    pub delete_budget: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stopped_timeout: Duration::from_secs(120),
            running_timeout: Duration::from_secs(500),
            image_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            modify_budget: Duration::from_secs(360),
            delete_budget: Duration::from_secs(300),
        }
    }
}

/// Drives one instance from its observed state to a declaration.
pub struct Reconciler {
    client: Arc<dyn RemoteApiClient>,
    config: ReconcileConfig,
    cancel: CancellationToken,
    waiter: StateWaiter,
    retry: RetryExecutor,
}

impl Reconciler {
    pub fn new(client: Arc<dyn RemoteApiClient>, config: ReconcileConfig) -> Self {
        Self::build(client, config, CancellationToken::new())
    }

    /// Use an externally owned token to stop the pass at the next wait.
    pub fn with_cancellation(self, cancel: CancellationToken) -> Self {
        Self::build(self.client, self.config, cancel)
    }

    fn build(client: Arc<dyn RemoteApiClient>, config: ReconcileConfig, cancel: CancellationToken) -> Self {
        let waiter = StateWaiter::new(client.clone(), config.poll_interval, cancel.clone());
        let retry = RetryExecutor::new(cancel.clone());
        Self {
            client,
            config,
            cancel,
            waiter,
            retry,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create when there is no baseline or the entity is gone, update otherwise.
    pub async fn reconcile(
        &self,
        desired: &InstanceSpec,
        baseline: Option<&InstanceRecord>,
    ) -> Result<InstanceRecord, ReconcileError> {
        let Some(record) = baseline else {
            return self.create(desired).await;
        };
        match self.read(record.instance_id()).await? {
            Some(_) => self.update(record, desired).await,
            None => {
                warn!(
                    "⚠️ [reconcile] instance {} disappeared, creating a replacement",
                    record.instance_id()
                );
                self.create(desired).await
            }
        }
    }

    /// Create, wait Stopped, allocate a public ip when bandwidth is declared,
    /// start, wait Running, then converge the remaining attributes.
    ///
    /// Failures after the platform assigned an id come back as
    /// [`ReconcileError::Incomplete`] carrying that id.
    pub async fn create(&self, desired: &InstanceSpec) -> Result<InstanceRecord, ReconcileError> {
        let started = Instant::now();
        let log_id = logger::log_event_with_metadata(
            "CREATE_INSTANCE",
            "in_progress",
            None,
            None,
            Some(json!({
                "image_id": desired.image_id,
                "instance_type": desired.instance_type,
                "zone": desired.zone,
                "charge_type": desired.billing.charge_type.as_str(),
                "bandwidth_out": desired.network.bandwidth_out,
            })),
        );
        let result = self.create_inner(desired).await;
        log_result(log_id, "CREATE_INSTANCE", started, &result);
        result
    }

    async fn create_inner(&self, desired: &InstanceSpec) -> Result<InstanceRecord, ReconcileError> {
        self.checkpoint(Phase::Create)?;
        lifecycle_guard::check_declaration(desired)?;

        info!(
            "🔵 [reconcile_create] creating {} from image {}",
            desired.instance_type, desired.image_id
        );
        let instance_id = self
            .client
            .create_instance(desired)
            .await
            .map_err(|e| ReconcileError::remote(Phase::Create, "", e))?;
        info!("✅ [reconcile_create] instance {} created", instance_id);

        self.bring_up(&instance_id, desired)
            .await
            .map_err(|source| ReconcileError::Incomplete {
                instance_id: instance_id.clone(),
                source: Box::new(source),
            })
    }

    async fn bring_up(
        &self,
        instance_id: &str,
        desired: &InstanceSpec,
    ) -> Result<InstanceRecord, ReconcileError> {
        self.waiter
            .wait_for_status(instance_id, InstanceStatus::Stopped, self.config.stopped_timeout)
            .await?;

        if desired.network.bandwidth_out > 0 {
            self.allocate_public_ip(instance_id).await?;
        }

        let running = self.start(instance_id).await?;

        // The password went in with the create request; echo it so the
        // follow-up update does not apply it again.
        let baseline = InstanceRecord::new(running, desired);
        self.converge(&baseline, desired).await
    }

    /// Observed state with tags and role attachment. `None` when the entity
    /// no longer exists. Tags that cannot be read are reported as empty.
    pub async fn read(&self, instance_id: &str) -> Result<Option<InstanceState>, ReconcileError> {
        let Some(mut state) = self.describe(instance_id).await? else {
            return Ok(None);
        };

        state.tags = match self.client.get_tags(instance_id).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(
                    "⚠️ [reconcile_read] tags of {} unavailable: {:#}",
                    instance_id, e
                );
                TagSet::new()
            }
        };

        state.role_name = self.read_role(instance_id, &state).await?;
        Ok(Some(state))
    }

    async fn describe(&self, instance_id: &str) -> Result<Option<InstanceState>, ReconcileError> {
        match self.client.describe_instance(instance_id).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if classify_error(&e) == ErrorClass::NotFound => {
                warn!("⚠️ [reconcile_read] instance {} not found", instance_id);
                Ok(None)
            }
            Err(e) => Err(ReconcileError::remote(Phase::Read, instance_id, e)),
        }
    }

    async fn read_role(
        &self,
        instance_id: &str,
        state: &InstanceState,
    ) -> Result<Option<String>, ReconcileError> {
        if state.vswitch_id.is_empty() {
            return Ok(state.role_name.clone());
        }
        let policy = self.policy(self.config.modify_budget, retry::role_attachment);
        self.retry
            .run(&policy, Phase::Role, instance_id, || {
                self.client.describe_role_attachment(instance_id)
            })
            .await
    }

    /// Converge an existing instance. `baseline` supplies the id and the
    /// last applied password; everything else is compared against a fresh read.
    pub async fn update(
        &self,
        baseline: &InstanceRecord,
        desired: &InstanceSpec,
    ) -> Result<InstanceRecord, ReconcileError> {
        let started = Instant::now();
        let log_id = logger::log_event("UPDATE_INSTANCE", "in_progress", Some(baseline.instance_id()), None);
        let result = self.converge(baseline, desired).await;
        log_result(log_id, "UPDATE_INSTANCE", started, &result);
        result
    }

    async fn converge(
        &self,
        baseline: &InstanceRecord,
        desired: &InstanceSpec,
    ) -> Result<InstanceRecord, ReconcileError> {
        let instance_id = baseline.instance_id();
        self.checkpoint(Phase::Read)?;

        let observed = self.read_existing(instance_id).await?;
        let changes = ChangeSet::compute(desired, &observed, baseline.password.as_deref());
        lifecycle_guard::check_update(desired, &observed, &changes)?;

        if changes.is_empty() {
            info!("✅ [reconcile_update] {} already converged", instance_id);
        } else {
            info!(
                "🔵 [reconcile_update] {} pending: {:?}",
                instance_id,
                changes.pending()
            );
        }

        self.apply_tags(instance_id, &changes).await?;
        self.apply_security_groups(instance_id, &changes).await?;

        if !changes.attributes.is_empty() {
            self.client
                .modify_attributes(instance_id, &changes.attributes)
                .await
                .map_err(|e| ReconcileError::remote(Phase::Attributes, instance_id, e))?;
        }

        if changes.requires_reboot() {
            self.reboot_window(instance_id, &changes).await?;
        }

        if let Some(role) = &changes.role {
            info!("🔐 [reconcile_update] attaching role {} to {}", role, instance_id);
            self.client
                .attach_role(instance_id, role)
                .await
                .map_err(|e| ReconcileError::remote(Phase::Role, instance_id, e))?;
        }

        self.apply_network(instance_id, &changes).await?;
        self.apply_charge_type(instance_id, &changes).await?;

        let state = self.read_existing(instance_id).await?;
        Ok(InstanceRecord::new(state, desired))
    }

    /// Stop at most once, apply every pending reboot-class change in fixed
    /// order, start again.
    async fn reboot_window(&self, instance_id: &str, changes: &ChangeSet) -> Result<(), ReconcileError> {
        let kinds = changes.reboot_changes();
        info!(
            "🔄 [reconcile_update] {} needs a stop for {:?}",
            instance_id, kinds
        );

        let current = self
            .client
            .describe_instance(instance_id)
            .await
            .map_err(|e| ReconcileError::remote(Phase::Stop, instance_id, e))?;
        match current.status {
            InstanceStatus::Running => self.stop(instance_id).await?,
            InstanceStatus::Starting => {
                self.waiter
                    .wait_for_status(instance_id, InstanceStatus::Running, self.config.running_timeout)
                    .await?;
                self.stop(instance_id).await?;
            }
            InstanceStatus::Pending | InstanceStatus::Stopping | InstanceStatus::Stopped => {}
        }
        self.waiter
            .wait_for_status(instance_id, InstanceStatus::Stopped, self.config.stopped_timeout)
            .await?;

        for kind in kinds {
            self.checkpoint(Phase::Apply(kind))?;
            self.apply_reboot_change(instance_id, kind, changes).await?;
        }

        self.start(instance_id).await?;
        Ok(())
    }

    async fn apply_reboot_change(
        &self,
        instance_id: &str,
        kind: ChangeKind,
        changes: &ChangeSet,
    ) -> Result<(), ReconcileError> {
        let phase = Phase::Apply(kind);
        let remote = |e: anyhow::Error| ReconcileError::remote(phase, instance_id, e);

        match kind {
            ChangeKind::Image => {
                if let Some(image) = &changes.image {
                    info!(
                        "💿 [reconcile_update] {} system disk {} -> {}",
                        instance_id, image.from, image.to
                    );
                    self.client
                        .replace_system_disk(instance_id, &image.to, image.disk_size)
                        .await
                        .map_err(remote)?;
                    self.waiter
                        .wait_for_image(instance_id, &image.to, self.config.image_timeout)
                        .await?;
                }
            }
            ChangeKind::VpcAttribute => {
                if let Some(vpc) = &changes.vpc {
                    info!(
                        "🌐 [reconcile_update] {} moving to vswitch {}",
                        instance_id, vpc.vswitch_id
                    );
                    self.client
                        .modify_vpc_attribute(instance_id, &vpc.vswitch_id, vpc.private_ip.as_deref())
                        .await
                        .map_err(remote)?;
                }
            }
            ChangeKind::Password => {
                if let Some(password) = &changes.password {
                    let change = AttributeChange {
                        password: Some(password.clone()),
                        ..Default::default()
                    };
                    self.client
                        .modify_attributes(instance_id, &change)
                        .await
                        .map_err(remote)?;
                }
            }
            ChangeKind::InstanceType => {
                if let Some((from, to)) = &changes.instance_type {
                    info!("📐 [reconcile_update] {} type {} -> {}", instance_id, from, to);
                    let policy = self.policy(self.config.modify_budget, retry::throttling_only);
                    self.retry
                        .run(&policy, phase, instance_id, || {
                            self.client.modify_instance_type(instance_id, to)
                        })
                        .await?;
                }
            }
            ChangeKind::NetworkSpec
            | ChangeKind::ChargeType
            | ChangeKind::SecurityGroups
            | ChangeKind::Tags
            | ChangeKind::Attributes
            | ChangeKind::Role => {}
        }
        Ok(())
    }

    async fn apply_tags(&self, instance_id: &str, changes: &ChangeSet) -> Result<(), ReconcileError> {
        let tags = &changes.tags;
        if !tags.remove.is_empty() {
            self.client
                .remove_tags(instance_id, &tags.remove)
                .await
                .map_err(|e| ReconcileError::remote(Phase::Tags, instance_id, e))?;
        }
        if !tags.add.is_empty() {
            self.client
                .add_tags(instance_id, &tags.add)
                .await
                .map_err(|e| ReconcileError::remote(Phase::Tags, instance_id, e))?;
        }
        Ok(())
    }

    /// Join new security groups, then leave the dropped ones.
    async fn apply_security_groups(
        &self,
        instance_id: &str,
        changes: &ChangeSet,
    ) -> Result<(), ReconcileError> {
        let groups = &changes.security_groups;
        if !groups.join.is_empty() {
            self.client
                .join_security_groups(instance_id, &groups.join)
                .await
                .map_err(|e| ReconcileError::remote(Phase::SecurityGroups, instance_id, e))?;
        }
        if !groups.leave.is_empty() {
            self.client
                .leave_security_groups(instance_id, &groups.leave)
                .await
                .map_err(|e| ReconcileError::remote(Phase::SecurityGroups, instance_id, e))?;
        }
        Ok(())
    }

    async fn apply_network(&self, instance_id: &str, changes: &ChangeSet) -> Result<(), ReconcileError> {
        let Some(network) = &changes.network else {
            return Ok(());
        };
        let policy = self.policy(self.config.modify_budget, retry::platform_transient);
        self.retry
            .run(&policy, Phase::Apply(ChangeKind::NetworkSpec), instance_id, || {
                self.client.modify_network_spec(instance_id, &network.request)
            })
            .await?;

        if network.allocate_public_ip {
            self.allocate_public_ip(instance_id).await?;
        }
        Ok(())
    }

    async fn apply_charge_type(&self, instance_id: &str, changes: &ChangeSet) -> Result<(), ReconcileError> {
        let Some(change) = &changes.charge_type else {
            return Ok(());
        };
        info!(
            "💳 [reconcile_update] {} charge type -> {}{}",
            instance_id,
            change.charge_type.as_str(),
            if change.dry_run { " (dry run)" } else { "" }
        );
        let policy = self.policy(self.config.modify_budget, retry::platform_transient);
        self.retry
            .run(&policy, Phase::Apply(ChangeKind::ChargeType), instance_id, || {
                self.client.modify_charge_type(instance_id, change)
            })
            .await
    }

    /// Idempotent: an instance that is already gone counts as deleted.
    /// Prepaid instances are refused before any call is made.
    pub async fn delete(&self, record: &InstanceRecord) -> Result<(), ReconcileError> {
        let instance_id = record.instance_id();
        let started = Instant::now();
        let log_id = logger::log_event("DELETE_INSTANCE", "in_progress", Some(instance_id), None);

        let result = match lifecycle_guard::check_delete(instance_id, record.declared_charge_type) {
            Err(violation) => Err(violation.into()),
            Ok(()) => {
                let policy = self.policy(self.config.delete_budget, retry::unless_rejected);
                match self
                    .retry
                    .run(&policy, Phase::Delete, instance_id, || self.delete_attempt(instance_id))
                    .await
                {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        };

        log_result(log_id, "DELETE_INSTANCE", started, &result);
        result
    }

    async fn delete_attempt(&self, instance_id: &str) -> anyhow::Result<()> {
        let state = match self.client.describe_instance(instance_id).await {
            Ok(state) => state,
            Err(e) if classify_error(&e) == ErrorClass::NotFound => {
                info!("✅ [reconcile_delete] instance {} already gone", instance_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        lifecycle_guard::check_delete(instance_id, state.charge_type).map_err(ReconcileError::from)?;

        if state.status != InstanceStatus::Stopped {
            info!(
                "🛑 [reconcile_delete] force stopping {} ({})",
                instance_id, state.status
            );
            self.client.stop_instance(instance_id, true).await?;
            self.waiter
                .wait_for_status(instance_id, InstanceStatus::Stopped, self.config.stopped_timeout)
                .await?;
        }

        self.client.delete_instance(instance_id).await?;
        info!("🗑️ [reconcile_delete] instance {} deleted", instance_id);
        Ok(())
    }

    async fn start(&self, instance_id: &str) -> Result<InstanceState, ReconcileError> {
        self.client
            .start_instance(instance_id)
            .await
            .map_err(|e| ReconcileError::remote(Phase::Start, instance_id, e))?;
        self.waiter
            .wait_for_status(instance_id, InstanceStatus::Running, self.config.running_timeout)
            .await
    }

    async fn stop(&self, instance_id: &str) -> Result<(), ReconcileError> {
        self.client
            .stop_instance(instance_id, false)
            .await
            .map_err(|e| ReconcileError::remote(Phase::Stop, instance_id, e))
    }

    async fn allocate_public_ip(&self, instance_id: &str) -> Result<(), ReconcileError> {
        let address = self
            .client
            .allocate_public_ip(instance_id)
            .await
            .map_err(|e| ReconcileError::remote(Phase::AllocatePublicIp, instance_id, e))?;
        info!("🌍 [reconcile] {} public ip {}", instance_id, address);
        Ok(())
    }

    /// Observed state used as the diff base. Unlike [`Reconciler::read`], a
    /// tag read that keeps failing aborts the pass.
    async fn read_existing(&self, instance_id: &str) -> Result<InstanceState, ReconcileError> {
        let mut state = self
            .describe(instance_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound {
                phase: Phase::Read,
                instance_id: instance_id.to_string(),
            })?;

        let policy = self.policy(self.config.modify_budget, retry::platform_transient);
        state.tags = self
            .retry
            .run(&policy, Phase::Tags, instance_id, || self.client.get_tags(instance_id))
            .await?;
        state.role_name = self.read_role(instance_id, &state).await?;
        Ok(state)
    }

    fn policy(&self, budget: Duration, classify: retry::Classifier) -> RetryPolicy {
        RetryPolicy::new(budget, self.config.retry_interval, classify)
    }

    fn checkpoint(&self, phase: Phase) -> Result<(), ReconcileError> {
        if self.cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled { phase });
        }
        Ok(())
    }
}

fn log_result<T>(log_id: Uuid, action_type: &str, started: Instant, result: &Result<T, ReconcileError>) {
    let duration_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(_) => logger::log_event_complete(log_id, action_type, "success", duration_ms, None),
        Err(e) => logger::log_event_complete(
            log_id,
            action_type,
            "failed",
            duration_ms,
            Some(&e.to_string()),
        ),
    }
}
