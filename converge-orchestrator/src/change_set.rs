use std::fmt;

use converge_common::{InstanceSpec, InstanceState, TagSet};
use converge_providers::{AttributeChange, ChargeTypeChange, NetworkSpecChange};

/// Attribute groups the reconciler applies as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Image,
    VpcAttribute,
    Password,
    InstanceType,
    NetworkSpec,
    ChargeType,
    SecurityGroups,
    Tags,
    Attributes,
    Role,
}

impl ChangeKind {
    /// Reboot-class changes, in the order they are applied while stopped.
    pub const REBOOT_SEQUENCE: [ChangeKind; 4] = [
        ChangeKind::Image,
        ChangeKind::VpcAttribute,
        ChangeKind::Password,
        ChangeKind::InstanceType,
    ];

    pub fn requires_reboot(&self) -> bool {
        Self::REBOOT_SEQUENCE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Image => "image",
            ChangeKind::VpcAttribute => "vpc attribute",
            ChangeKind::Password => "password",
            ChangeKind::InstanceType => "instance type",
            ChangeKind::NetworkSpec => "network spec",
            ChangeKind::ChargeType => "charge type",
            ChangeKind::SecurityGroups => "security groups",
            ChangeKind::Tags => "tags",
            ChangeKind::Attributes => "attributes",
            ChangeKind::Role => "role",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagDiff {
    /// Added or overwritten
    pub add: TagSet,
    /// Keys no longer declared
    pub remove: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroupDiff {
    pub join: Vec<String>,
    pub leave: Vec<String>,
}

impl SecurityGroupDiff {
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.leave.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    pub from: String,
    pub to: String,
    pub disk_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpcChange {
    /// Empty when the declaration drops the vswitch.
    pub vswitch_id: String,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkChange {
    pub request: NetworkSpecChange,
    /// Outbound bandwidth goes from zero to positive.
    pub allocate_public_ip: bool,
}

/// Difference between a declaration and the freshly observed entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub tags: TagDiff,
    pub security_groups: SecurityGroupDiff,
    /// Name, description and host name; applied without a reboot.
    pub attributes: AttributeChange,
    pub role: Option<String>,
    pub image: Option<ImageChange>,
    pub vpc: Option<VpcChange>,
    pub password: Option<String>,
    pub instance_type: Option<(String, String)>,
    pub network: Option<NetworkChange>,
    pub charge_type: Option<ChargeTypeChange>,
    /// Declared system disk size differs from the observed one (before, after).
    pub system_disk_size: Option<(u32, u32)>,
}

impl ChangeSet {
    /// `known_password` is the password last applied, since the platform
    /// never reports it back.
    pub fn compute(
        desired: &InstanceSpec,
        observed: &InstanceState,
        known_password: Option<&str>,
    ) -> Self {
        let mut changes = ChangeSet {
            tags: diff_tags(&desired.tags, &observed.tags),
            ..Default::default()
        };

        changes.security_groups = SecurityGroupDiff {
            join: desired
                .security_group_ids
                .difference(&observed.security_group_ids)
                .cloned()
                .collect(),
            leave: observed
                .security_group_ids
                .difference(&desired.security_group_ids)
                .cloned()
                .collect(),
        };

        if desired.instance_name != observed.instance_name {
            changes.attributes.instance_name = Some(desired.instance_name.clone());
        }
        if let Some(description) = &desired.description {
            if *description != observed.description {
                changes.attributes.description = Some(description.clone());
            }
        }
        if let Some(host_name) = &desired.host_name {
            if *host_name != observed.host_name {
                changes.attributes.host_name = Some(host_name.clone());
            }
        }

        if let Some(role) = desired.role_name() {
            if observed.role_name.as_deref() != Some(role) {
                changes.role = Some(role.to_string());
            }
        }

        if let Some(password) = &desired.password {
            if known_password != Some(password.as_str()) {
                changes.password = Some(password.clone());
            }
        }

        if let Some(size) = desired.system_disk.size {
            if size != observed.system_disk.size {
                changes.system_disk_size = Some((observed.system_disk.size, size));
            }
        }

        if desired.image_id != observed.image_id {
            changes.image = Some(ImageChange {
                from: observed.image_id.clone(),
                to: desired.image_id.clone(),
                disk_size: desired.system_disk.size,
            });
        }

        let vswitch = desired.vswitch_id();
        let private_ip = desired
            .network
            .private_ip
            .as_deref()
            .filter(|ip| !vswitch.is_empty() && observed.private_ip.as_deref() != Some(*ip));
        if vswitch != observed.vswitch_id || private_ip.is_some() {
            changes.vpc = Some(VpcChange {
                vswitch_id: vswitch.to_string(),
                private_ip: private_ip.map(str::to_string),
            });
        }

        if desired.instance_type != observed.instance_type {
            changes.instance_type = Some((
                observed.instance_type.clone(),
                desired.instance_type.clone(),
            ));
        }

        changes.network = diff_network(desired, observed);

        if desired.billing.charge_type != observed.charge_type {
            let billing = &desired.billing;
            changes.charge_type = Some(ChargeTypeChange {
                charge_type: billing.charge_type,
                period: billing.period,
                period_unit: billing.period_unit,
                include_data_disks: billing.include_data_disks,
                auto_pay: true,
                dry_run: billing.dry_run,
            });
        }

        changes
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Image => self.image.is_some(),
            ChangeKind::VpcAttribute => self.vpc.is_some(),
            ChangeKind::Password => self.password.is_some(),
            ChangeKind::InstanceType => self.instance_type.is_some(),
            ChangeKind::NetworkSpec => self.network.is_some(),
            ChangeKind::ChargeType => self.charge_type.is_some(),
            ChangeKind::SecurityGroups => !self.security_groups.is_empty(),
            ChangeKind::Tags => !self.tags.is_empty(),
            ChangeKind::Attributes => !self.attributes.is_empty(),
            ChangeKind::Role => self.role.is_some(),
        }
    }

    /// Pending reboot-class changes in application order.
    pub fn reboot_changes(&self) -> Vec<ChangeKind> {
        ChangeKind::REBOOT_SEQUENCE
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }

    pub fn requires_reboot(&self) -> bool {
        !self.reboot_changes().is_empty()
    }

    pub fn pending(&self) -> Vec<ChangeKind> {
        [
            ChangeKind::Tags,
            ChangeKind::SecurityGroups,
            ChangeKind::Attributes,
            ChangeKind::Image,
            ChangeKind::VpcAttribute,
            ChangeKind::Password,
            ChangeKind::InstanceType,
            ChangeKind::Role,
            ChangeKind::NetworkSpec,
            ChangeKind::ChargeType,
        ]
        .into_iter()
        .filter(|kind| self.contains(*kind))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

fn diff_tags(desired: &TagSet, observed: &TagSet) -> TagDiff {
    TagDiff {
        add: desired
            .iter()
            .filter(|(k, v)| observed.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        remove: observed
            .keys()
            .filter(|k| !desired.contains_key(*k))
            .cloned()
            .collect(),
    }
}

fn diff_network(desired: &InstanceSpec, observed: &InstanceState) -> Option<NetworkChange> {
    let network = &desired.network;
    let mut request = NetworkSpecChange::default();

    // The bandwidth charge type only exists while outbound bandwidth does.
    if network.bandwidth_out > 0
        && observed.internet_charge_type != Some(network.internet_charge_type)
    {
        request.internet_charge_type = Some(network.internet_charge_type);
    }
    if let Some(bandwidth_in) = network.bandwidth_in {
        if bandwidth_in != observed.bandwidth_in {
            request.bandwidth_in = Some(bandwidth_in);
        }
    }
    if network.bandwidth_out != observed.bandwidth_out {
        request.bandwidth_out = Some(network.bandwidth_out);
    }

    if request.is_empty() {
        return None;
    }
    Some(NetworkChange {
        allocate_public_ip: observed.bandwidth_out == 0 && network.bandwidth_out > 0,
        request,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_common::{
        InstanceChargeType, InstanceStatus, InternetChargeType, SystemDiskInfo,
    };
    use std::collections::BTreeSet;

    fn spec() -> InstanceSpec {
        let mut spec = InstanceSpec::new("ubuntu_22_04", "ecs.n4.small");
        spec.security_group_ids = BTreeSet::from(["sg-a".to_string()]);
        spec.system_disk.size = Some(40);
        spec.description = Some("web".to_string());
        spec
    }

    fn observed(spec: &InstanceSpec) -> InstanceState {
        InstanceState {
            instance_id: "i-1".to_string(),
            status: InstanceStatus::Running,
            zone: "zone-a".to_string(),
            image_id: spec.image_id.clone(),
            instance_type: spec.instance_type.clone(),
            system_disk: SystemDiskInfo {
                category: spec.system_disk.category,
                size: 40,
            },
            vswitch_id: String::new(),
            private_ip: Some("10.0.0.1".to_string()),
            public_ip: None,
            internet_charge_type: None,
            bandwidth_in: 200,
            bandwidth_out: 0,
            charge_type: InstanceChargeType::PostPaid,
            spot_strategy: Default::default(),
            security_group_ids: spec.security_group_ids.clone(),
            instance_name: spec.instance_name.clone(),
            description: "web".to_string(),
            host_name: "iZhostZ".to_string(),
            key_pair_name: None,
            role_name: None,
            tags: TagSet::new(),
            creation_time: None,
        }
    }

    #[test]
    fn converged_entity_has_no_changes() {
        let spec = spec();
        let changes = ChangeSet::compute(&spec, &observed(&spec), None);
        assert!(changes.is_empty(), "unexpected: {:?}", changes.pending());
    }

    #[test]
    fn tag_diff_overwrites_and_removes() {
        let mut spec = spec();
        spec.tags.insert("env".to_string(), "new".to_string());
        spec.tags.insert("team".to_string(), "core".to_string());
        let mut state = observed(&spec);
        state.tags.insert("env".to_string(), "old".to_string());
        state.tags.insert("team".to_string(), "core".to_string());
        state.tags.insert("stale".to_string(), "x".to_string());

        let changes = ChangeSet::compute(&spec, &state, None);
        assert_eq!(
            changes.tags.add,
            TagSet::from([("env".to_string(), "new".to_string())])
        );
        assert_eq!(changes.tags.remove, vec!["stale".to_string()]);
        assert!(!changes.requires_reboot());
    }

    #[test]
    fn security_groups_join_before_leave() {
        let mut spec = spec();
        spec.security_group_ids = BTreeSet::from(["sg-b".to_string(), "sg-c".to_string()]);
        let mut state = observed(&spec);
        state.security_group_ids = BTreeSet::from(["sg-a".to_string(), "sg-b".to_string()]);

        let changes = ChangeSet::compute(&spec, &state, None);
        assert_eq!(changes.security_groups.join, vec!["sg-c".to_string()]);
        assert_eq!(changes.security_groups.leave, vec!["sg-a".to_string()]);
    }

    #[test]
    fn reboot_changes_follow_fixed_order() {
        let mut spec = spec();
        spec.instance_type = "ecs.n4.large".to_string();
        spec.image_id = "centos_7".to_string();
        spec.password = Some("Secret123".to_string());

        let changes = ChangeSet::compute(&spec, &observed(&spec), Some("Old123"));
        assert_eq!(
            changes.reboot_changes(),
            vec![
                ChangeKind::Image,
                ChangeKind::Password,
                ChangeKind::InstanceType
            ]
        );
        assert_eq!(changes.image.as_ref().map(|i| i.disk_size), Some(Some(40)));
    }

    #[test]
    fn known_password_is_not_reapplied() {
        let mut spec = spec();
        spec.password = Some("Secret123".to_string());
        let changes = ChangeSet::compute(&spec, &observed(&spec), Some("Secret123"));
        assert!(changes.password.is_none());
    }

    #[test]
    fn disk_size_change_is_recorded_without_image() {
        let mut spec = spec();
        spec.system_disk.size = Some(80);
        let changes = ChangeSet::compute(&spec, &observed(&spec), None);
        assert_eq!(changes.system_disk_size, Some((40, 80)));
        assert!(changes.image.is_none());
    }

    #[test]
    fn private_ip_only_compared_inside_vpc() {
        let mut spec = spec();
        spec.network.private_ip = Some("172.16.0.9".to_string());
        let classic = ChangeSet::compute(&spec, &observed(&spec), None);
        assert!(classic.vpc.is_none());

        spec.network.vswitch_id = Some("vsw-1".to_string());
        let mut state = observed(&spec);
        state.vswitch_id = "vsw-1".to_string();
        let vpc = ChangeSet::compute(&spec, &state, None);
        assert_eq!(
            vpc.vpc,
            Some(VpcChange {
                vswitch_id: "vsw-1".to_string(),
                private_ip: Some("172.16.0.9".to_string()),
            })
        );
    }

    #[test]
    fn bandwidth_from_zero_allocates_public_ip() {
        let mut spec = spec();
        spec.network.bandwidth_out = 5;
        spec.network.internet_charge_type = InternetChargeType::PayByBandwidth;
        let changes = ChangeSet::compute(&spec, &observed(&spec), None);
        let network = changes.network.expect("network change");
        assert!(network.allocate_public_ip);
        assert_eq!(network.request.bandwidth_out, Some(5));
        assert_eq!(
            network.request.internet_charge_type,
            Some(InternetChargeType::PayByBandwidth)
        );
    }

    #[test]
    fn bandwidth_increase_keeps_existing_ip() {
        let mut spec = spec();
        spec.network.bandwidth_out = 10;
        let mut state = observed(&spec);
        state.bandwidth_out = 5;
        state.internet_charge_type = Some(InternetChargeType::PayByTraffic);
        let changes = ChangeSet::compute(&spec, &state, None);
        let network = changes.network.expect("network change");
        assert!(!network.allocate_public_ip);
        assert_eq!(network.request.internet_charge_type, None);
    }

    #[test]
    fn charge_type_change_carries_billing() {
        let mut spec = spec();
        spec.billing.charge_type = InstanceChargeType::PrePaid;
        spec.billing.period = 3;
        let changes = ChangeSet::compute(&spec, &observed(&spec), None);
        let change = changes.charge_type.as_ref().expect("charge type change");
        assert_eq!(change.period, 3);
        assert!(change.auto_pay);
        assert!(!changes.requires_reboot());
    }

    #[test]
    fn role_diff_ignores_blank_declaration() {
        let mut spec = spec();
        spec.role_name = Some(" ".to_string());
        assert!(ChangeSet::compute(&spec, &observed(&spec), None).role.is_none());
        spec.role_name = Some("ops".to_string());
        assert_eq!(
            ChangeSet::compute(&spec, &observed(&spec), None).role.as_deref(),
            Some("ops")
        );
    }
}
