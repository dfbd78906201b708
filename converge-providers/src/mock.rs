use crate::error::ApiError;
use crate::requests::{AttributeChange, ChargeTypeChange, NetworkSpecChange};
use crate::RemoteApiClient;
use anyhow::Result;
use async_trait::async_trait;
use converge_common::{
    InstanceChargeType, InstanceSpec, InstanceState, InstanceStatus, SystemDiskInfo, TagSet,
};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

const DEFAULT_SYSTEM_DISK_GB: u32 = 40;
const DEFAULT_BANDWIDTH_IN: u32 = 200;

/// Operation names recorded in the call journal and used for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Describe,
    Start,
    Stop,
    Delete,
    ModifyAttributes,
    ReplaceSystemDisk,
    ModifyVpcAttribute,
    ModifyInstanceType,
    ModifyNetworkSpec,
    ModifyChargeType,
    AllocatePublicIp,
    JoinSecurityGroups,
    LeaveSecurityGroups,
    AddTags,
    RemoveTags,
    GetTags,
    AttachRole,
    DescribeRoleAttachment,
}

impl MockOp {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            MockOp::Describe | MockOp::GetTags | MockOp::DescribeRoleAttachment
        )
    }
}

struct MockInstance {
    state: InstanceState,
    // Describe calls left before a transitional status settles
    polls_left: u32,
    // Image applied by ReplaceSystemDisk, visible after the next describe
    pending_image: Option<String>,
    tags: TagSet,
    role_name: Option<String>,
    password: Option<String>,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    journal: Vec<(MockOp, String)>,
    faults: HashMap<MockOp, VecDeque<ApiError>>,
    next_ip: u8,
}

/// In-memory control plane.
///
/// Emulates the platform status machine (Pending -> Stopped on creation,
/// Starting -> Running, Stopping -> Stopped) with transitions observed on
/// describe, rejects reboot-class changes on instances that are not
/// stopped, and journals every call.
pub struct MockProvider {
    inner: Mutex<MockState>,
    settle_polls: u32,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState::default()),
            settle_polls: 1,
        }
    }

    /// Number of describe calls a transitional status survives.
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Queue an error returned by the next call of `op`.
    pub async fn inject_fault(&self, op: MockOp, error: ApiError) {
        let mut inner = self.inner.lock().await;
        inner.faults.entry(op).or_default().push_back(error);
    }

    /// Queue `count` copies of `error` for `op`.
    pub async fn inject_faults(&self, op: MockOp, error: ApiError, count: usize) {
        let mut inner = self.inner.lock().await;
        let queue = inner.faults.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Register an existing instance, replacing any instance with the same id.
    /// A transitional status settles after the usual number of describes.
    pub async fn seed_instance(&self, state: InstanceState) {
        let polls_left = self.settle_polls;
        let mut inner = self.inner.lock().await;
        let tags = state.tags.clone();
        let role_name = state.role_name.clone();
        inner.instances.insert(
            state.instance_id.clone(),
            MockInstance {
                state,
                polls_left,
                pending_image: None,
                tags,
                role_name,
                password: None,
            },
        );
    }

    /// Full observed view including tags and role, bypassing the journal.
    pub async fn snapshot(&self, instance_id: &str) -> Option<InstanceState> {
        let inner = self.inner.lock().await;
        inner.instances.get(instance_id).map(|i| {
            let mut state = i.state.clone();
            state.tags = i.tags.clone();
            state.role_name = i.role_name.clone();
            state
        })
    }

    pub async fn password(&self, instance_id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .instances
            .get(instance_id)
            .and_then(|i| i.password.clone())
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<MockOp> {
        let inner = self.inner.lock().await;
        inner.journal.iter().map(|(op, _)| *op).collect()
    }

    /// Mutating calls only, in order.
    pub async fn mutations(&self) -> Vec<MockOp> {
        self.calls()
            .await
            .into_iter()
            .filter(MockOp::is_mutation)
            .collect()
    }

    pub async fn count(&self, op: MockOp) -> usize {
        self.calls().await.into_iter().filter(|c| *c == op).count()
    }

    pub async fn clear_journal(&self) {
        self.inner.lock().await.journal.clear();
    }

    fn settle(instance: &mut MockInstance) {
        if let Some(image) = instance.pending_image.take() {
            instance.state.image_id = image;
        }
        let next = match instance.state.status {
            InstanceStatus::Pending | InstanceStatus::Stopping => Some(InstanceStatus::Stopped),
            InstanceStatus::Starting => Some(InstanceStatus::Running),
            InstanceStatus::Running | InstanceStatus::Stopped => None,
        };
        if let Some(next) = next {
            if instance.polls_left > 0 {
                instance.polls_left -= 1;
            } else {
                debug!(
                    "[mock] {} {} -> {}",
                    instance.state.instance_id, instance.state.status, next
                );
                instance.state.status = next;
            }
        }
    }
}

impl MockState {
    fn enter(&mut self, op: MockOp, instance_id: &str) -> Result<(), ApiError> {
        self.journal.push((op, instance_id.to_string()));
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn instance(&mut self, instance_id: &str) -> Result<&mut MockInstance, ApiError> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| ApiError::not_found(instance_id))
    }

    fn stopped(&mut self, instance_id: &str) -> Result<&mut MockInstance, ApiError> {
        let instance = self.instance(instance_id)?;
        if instance.state.status != InstanceStatus::Stopped {
            return Err(ApiError::incorrect_status(
                instance_id,
                instance.state.status.as_str(),
            ));
        }
        Ok(instance)
    }

    fn next_address(&mut self, prefix: &str) -> String {
        self.next_ip = self.next_ip.wrapping_add(1);
        format!("{}.{}", prefix, self.next_ip)
    }
}

#[async_trait]
impl RemoteApiClient for MockProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::Create, "")?;

        if spec.image_id.trim().is_empty() || spec.instance_type.trim().is_empty() {
            return Err(ApiError::new(
                "MissingParameter",
                "ImageId and InstanceType are mandatory",
            )
            .into());
        }

        let simple = uuid::Uuid::new_v4().simple().to_string();
        let instance_id = format!("i-{}", &simple[..20]);
        let private_ip = match spec.network.private_ip.clone() {
            Some(ip) if spec.is_vpc() => ip,
            _ if spec.is_vpc() => inner.next_address("172.16.0"),
            _ => inner.next_address("10.0.0"),
        };

        // The platform takes a single security group at creation time.
        let security_group_ids = spec.security_group_ids.iter().take(1).cloned().collect();

        let state = InstanceState {
            instance_id: instance_id.clone(),
            status: InstanceStatus::Pending,
            zone: spec.zone.clone().unwrap_or_else(|| "mock-zone-a".to_string()),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            system_disk: SystemDiskInfo {
                category: spec.system_disk.category,
                size: spec.system_disk.size.unwrap_or(DEFAULT_SYSTEM_DISK_GB),
            },
            vswitch_id: spec.vswitch_id().to_string(),
            private_ip: Some(private_ip),
            public_ip: None,
            internet_charge_type: (spec.network.bandwidth_out > 0)
                .then_some(spec.network.internet_charge_type),
            bandwidth_in: spec.network.bandwidth_in.unwrap_or(DEFAULT_BANDWIDTH_IN),
            bandwidth_out: spec.network.bandwidth_out,
            charge_type: spec.billing.charge_type,
            spot_strategy: spec.spot.strategy,
            security_group_ids,
            instance_name: spec.instance_name.clone(),
            description: spec.description.clone().unwrap_or_default(),
            host_name: spec
                .host_name
                .clone()
                .unwrap_or_else(|| format!("iZ{}Z", &simple[..12])),
            key_pair_name: spec.key_pair_name.clone(),
            role_name: None,
            tags: TagSet::new(),
            creation_time: Some(chrono::Utc::now()),
        };

        inner.instances.insert(
            instance_id.clone(),
            MockInstance {
                state,
                polls_left: self.settle_polls,
                pending_image: None,
                tags: TagSet::new(),
                role_name: None,
                password: spec.password.clone(),
            },
        );
        debug!("[mock] created {}", instance_id);
        Ok(instance_id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceState> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::Describe, instance_id)?;
        let instance = inner.instance(instance_id)?;
        Self::settle(instance);
        Ok(instance.state.clone())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::Start, instance_id)?;
        let settle_polls = self.settle_polls;
        let instance = inner.stopped(instance_id)?;
        instance.state.status = InstanceStatus::Starting;
        instance.polls_left = settle_polls;
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::Stop, instance_id)?;
        let settle_polls = self.settle_polls;
        let instance = inner.instance(instance_id)?;
        match instance.state.status {
            InstanceStatus::Stopped | InstanceStatus::Stopping => {}
            _ => {
                instance.state.status = InstanceStatus::Stopping;
                instance.polls_left = if force { 0 } else { settle_polls };
            }
        }
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::Delete, instance_id)?;
        inner.stopped(instance_id)?;
        inner.instances.remove(instance_id);
        Ok(())
    }

    async fn modify_attributes(&self, instance_id: &str, change: &AttributeChange) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ModifyAttributes, instance_id)?;
        let instance = if change.password.is_some() {
            inner.stopped(instance_id)?
        } else {
            inner.instance(instance_id)?
        };
        if let Some(name) = &change.instance_name {
            instance.state.instance_name = name.clone();
        }
        if let Some(description) = &change.description {
            instance.state.description = description.clone();
        }
        if let Some(host_name) = &change.host_name {
            instance.state.host_name = host_name.clone();
        }
        if let Some(password) = &change.password {
            instance.password = Some(password.clone());
        }
        Ok(())
    }

    async fn replace_system_disk(
        &self,
        instance_id: &str,
        image_id: &str,
        disk_size: Option<u32>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ReplaceSystemDisk, instance_id)?;
        let instance = inner.stopped(instance_id)?;
        if let Some(size) = disk_size {
            if size < instance.state.system_disk.size {
                return Err(ApiError::new(
                    "InvalidSystemDiskSize.LessThanImageSize",
                    "The system disk cannot shrink",
                )
                .into());
            }
            instance.state.system_disk.size = size;
        }
        instance.pending_image = Some(image_id.to_string());
        Ok(())
    }

    async fn modify_vpc_attribute(
        &self,
        instance_id: &str,
        vswitch_id: &str,
        private_ip: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ModifyVpcAttribute, instance_id)?;
        let address = match private_ip {
            Some(ip) => ip.to_string(),
            None => inner.next_address("172.16.1"),
        };
        let instance = inner.stopped(instance_id)?;
        instance.state.vswitch_id = vswitch_id.to_string();
        instance.state.private_ip = Some(address);
        Ok(())
    }

    async fn modify_instance_type(&self, instance_id: &str, instance_type: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ModifyInstanceType, instance_id)?;
        let instance = inner.stopped(instance_id)?;
        if instance.state.charge_type == InstanceChargeType::PrePaid {
            return Err(ApiError::new(
                "InvalidInstanceChargeType.Unsupported",
                "PrePaid instances cannot change spec this way",
            )
            .into());
        }
        instance.state.instance_type = instance_type.to_string();
        Ok(())
    }

    async fn modify_network_spec(
        &self,
        instance_id: &str,
        change: &NetworkSpecChange,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ModifyNetworkSpec, instance_id)?;
        let instance = inner.instance(instance_id)?;
        if let Some(out) = change.bandwidth_out {
            instance.state.bandwidth_out = out;
            if out == 0 {
                instance.state.internet_charge_type = None;
                instance.state.public_ip = None;
            } else if instance.state.internet_charge_type.is_none() {
                instance.state.internet_charge_type = Some(Default::default());
            }
        }
        if let Some(bandwidth_in) = change.bandwidth_in {
            instance.state.bandwidth_in = bandwidth_in;
        }
        if let Some(ict) = change.internet_charge_type {
            instance.state.internet_charge_type = Some(ict);
        }
        Ok(())
    }

    async fn modify_charge_type(&self, instance_id: &str, change: &ChargeTypeChange) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::ModifyChargeType, instance_id)?;
        let instance = inner.instance(instance_id)?;
        if change.charge_type == InstanceChargeType::PostPaid {
            return Err(ApiError::new(
                "InvalidInstanceChargeType.ValueNotSupported",
                "Only PostPaid to PrePaid conversion is supported",
            )
            .into());
        }
        if !change.dry_run {
            instance.state.charge_type = change.charge_type;
        }
        Ok(())
    }

    async fn allocate_public_ip(&self, instance_id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::AllocatePublicIp, instance_id)?;
        let address = inner.next_address("47.100.0");
        let instance = inner.instance(instance_id)?;
        if instance.state.bandwidth_out == 0 {
            return Err(ApiError::new(
                "InvalidInternetMaxBandwidthOut",
                "A public ip needs outbound bandwidth",
            )
            .into());
        }
        if instance.state.public_ip.is_some() {
            return Err(ApiError::new("InvalidIp.Allocated", "A public ip is already allocated").into());
        }
        instance.state.public_ip = Some(address.clone());
        Ok(address)
    }

    async fn join_security_groups(&self, instance_id: &str, group_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::JoinSecurityGroups, instance_id)?;
        let instance = inner.instance(instance_id)?;
        instance
            .state
            .security_group_ids
            .extend(group_ids.iter().cloned());
        Ok(())
    }

    async fn leave_security_groups(&self, instance_id: &str, group_ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::LeaveSecurityGroups, instance_id)?;
        let instance = inner.instance(instance_id)?;
        let remaining = instance
            .state
            .security_group_ids
            .iter()
            .filter(|g| !group_ids.contains(g))
            .count();
        if remaining == 0 {
            return Err(ApiError::new(
                "InvalidSecurityGroupId.SingleGroup",
                "An instance must belong to at least one security group",
            )
            .into());
        }
        for group in group_ids {
            instance.state.security_group_ids.remove(group);
        }
        Ok(())
    }

    async fn add_tags(&self, instance_id: &str, tags: &TagSet) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::AddTags, instance_id)?;
        let instance = inner.instance(instance_id)?;
        instance
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn remove_tags(&self, instance_id: &str, keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::RemoveTags, instance_id)?;
        let instance = inner.instance(instance_id)?;
        for key in keys {
            instance.tags.remove(key);
        }
        Ok(())
    }

    async fn get_tags(&self, instance_id: &str) -> Result<TagSet> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::GetTags, instance_id)?;
        Ok(inner.instance(instance_id)?.tags.clone())
    }

    async fn attach_role(&self, instance_id: &str, role_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::AttachRole, instance_id)?;
        let instance = inner.instance(instance_id)?;
        if instance.state.vswitch_id.is_empty() {
            return Err(ApiError::new(
                "InvalidInstanceType.NotVpc",
                "Role attachment requires a VPC instance",
            )
            .into());
        }
        instance.role_name = Some(role_name.to_string());
        Ok(())
    }

    async fn describe_role_attachment(&self, instance_id: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.enter(MockOp::DescribeRoleAttachment, instance_id)?;
        Ok(inner.instance(instance_id)?.role_name.clone())
    }
}
