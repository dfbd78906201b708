use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type TagSet = BTreeMap<String, String>;

pub const DEFAULT_INSTANCE_NAME: &str = "ECS-Instance";

// --- Enums ---

/// Status reported by the remote platform for a compute instance.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Pending,  // Just created, not yet bootable
    Starting, // Start accepted, booting
    Running,  // Up
    Stopping, // Stop accepted, shutting down
    Stopped,  // Powered off, reboot-class changes allowed
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Starting => "Starting",
            InstanceStatus::Running => "Running",
            InstanceStatus::Stopping => "Stopping",
            InstanceStatus::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instance status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for InstanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceStatus::Pending),
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// Billing mode of the instance itself.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceChargeType {
    PrePaid,
    #[default]
    PostPaid,
}

impl InstanceChargeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceChargeType::PrePaid => "PrePaid",
            InstanceChargeType::PostPaid => "PostPaid",
        }
    }
}

/// Billing mode of the public bandwidth.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum InternetChargeType {
    PayByBandwidth,
    #[default]
    PayByTraffic,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodUnit {
    Week,
    #[default]
    Month,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpotStrategy {
    #[default]
    NoSpot,
    SpotWithPriceLimit,
    SpotAsPriceGo,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiskCategory {
    Cloud,
    #[default]
    CloudEfficiency,
    CloudSsd,
    EphemeralSsd,
}

// --- Desired configuration ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SystemDisk {
    #[serde(default)]
    pub category: DiskCategory,
    /// GB. `None` keeps whatever the platform picked.
    #[serde(default)]
    pub size: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct NetworkSpec {
    #[serde(default, alias = "subnet_id")]
    pub vswitch_id: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub internet_charge_type: InternetChargeType,
    #[serde(default)]
    pub bandwidth_in: Option<u32>,
    #[serde(default)]
    pub bandwidth_out: u32,
}

fn default_period() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Billing {
    #[serde(default)]
    pub charge_type: InstanceChargeType,
    #[serde(default = "default_period")]
    pub period: u32,
    #[serde(default)]
    pub period_unit: PeriodUnit,
    #[serde(default = "default_true")]
    pub include_data_disks: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Billing {
    fn default() -> Self {
        Self {
            charge_type: InstanceChargeType::PostPaid,
            period: default_period(),
            period_unit: PeriodUnit::Month,
            include_data_disks: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Spot {
    #[serde(default)]
    pub strategy: SpotStrategy,
    #[serde(default)]
    pub price_limit: Option<f64>,
}

fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_string()
}

/// Declared target configuration for one compute instance.
///
/// Supplied already validated. Zone, system-disk category, user-data,
/// key pair and spot settings are force-new: they only matter at creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceSpec {
    #[serde(default)]
    pub zone: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    #[serde(default)]
    pub system_disk: SystemDisk,
    #[serde(default)]
    pub network: NetworkSpec,
    #[serde(default)]
    pub billing: Billing,
    #[serde(default)]
    pub spot: Spot,
    #[serde(default)]
    pub security_group_ids: BTreeSet<String>,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub user_data: Option<String>,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub key_pair_name: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
}

impl InstanceSpec {
    pub fn new(image_id: &str, instance_type: &str) -> Self {
        Self {
            zone: None,
            image_id: image_id.to_string(),
            instance_type: instance_type.to_string(),
            system_disk: SystemDisk::default(),
            network: NetworkSpec::default(),
            billing: Billing::default(),
            spot: Spot::default(),
            security_group_ids: BTreeSet::new(),
            instance_name: default_instance_name(),
            description: None,
            host_name: None,
            password: None,
            user_data: None,
            role_name: None,
            key_pair_name: None,
            tags: TagSet::new(),
        }
    }

    /// Declared vswitch id, empty when the instance is not in a VPC.
    pub fn vswitch_id(&self) -> &str {
        self.network.vswitch_id.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn is_vpc(&self) -> bool {
        !self.vswitch_id().is_empty()
    }

    /// Role name with blank values treated as unset.
    pub fn role_name(&self) -> Option<&str> {
        self.role_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// --- Observed state ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct SystemDiskInfo {
    pub category: DiskCategory,
    pub size: u32,
}

/// Instance as reported by the remote platform at one point in time.
///
/// `Describe` fills everything except `tags` and `role_name`, which are
/// separate read-back queries.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceState {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub zone: String,
    pub image_id: String,
    pub instance_type: String,
    pub system_disk: SystemDiskInfo,
    /// Empty for classic-network instances.
    #[serde(default)]
    pub vswitch_id: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    /// `None` when the instance has no public bandwidth.
    #[serde(default)]
    pub internet_charge_type: Option<InternetChargeType>,
    #[serde(default)]
    pub bandwidth_in: u32,
    #[serde(default)]
    pub bandwidth_out: u32,
    pub charge_type: InstanceChargeType,
    #[serde(default)]
    pub spot_strategy: SpotStrategy,
    #[serde(default)]
    pub security_group_ids: BTreeSet<String>,
    pub instance_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub key_pair_name: Option<String>,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
}

/// Result of a reconciliation pass: the observed state plus the spec fields
/// the platform never reports back.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceRecord {
    #[serde(flatten)]
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Declared billing mode, kept so Delete can refuse Prepaid entities
    /// without calling the platform.
    #[serde(default)]
    pub declared_charge_type: InstanceChargeType,
}

impl InstanceRecord {
    pub fn new(state: InstanceState, spec: &InstanceSpec) -> Self {
        Self {
            state,
            password: spec.password.clone(),
            user_data: spec.user_data.clone(),
            declared_charge_type: spec.billing.charge_type,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.state.instance_id
    }
}
