use anyhow::Result;
use async_trait::async_trait;
use converge_common::{InstanceSpec, InstanceState, TagSet};

pub mod error;

pub use error::{classify_error, ApiError, ErrorClass};
pub use requests::{AttributeChange, ChargeTypeChange, NetworkSpecChange};

/// Typed access to the remote compute control plane.
///
/// Implementations wrap platform failures in [`ApiError`] so callers can
/// classify them with [`classify_error`]; nothing above this trait looks at
/// raw error text.
#[async_trait]
pub trait RemoteApiClient: Send + Sync {
    /// Create the instance and return the platform-assigned id.
    /// Tags and role attachment are not applied here.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    /// Current attributes and status. `tags` and `role_name` are left empty;
    /// use [`get_tags`](Self::get_tags) and
    /// [`describe_role_attachment`](Self::describe_role_attachment).
    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceState>;

    async fn start_instance(&self, instance_id: &str) -> Result<()>;
    async fn stop_instance(&self, instance_id: &str, force: bool) -> Result<()>;
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    async fn modify_attributes(&self, instance_id: &str, change: &AttributeChange) -> Result<()>;

    /// Requires the instance to be stopped. `disk_size` in GB.
    async fn replace_system_disk(
        &self,
        instance_id: &str,
        image_id: &str,
        disk_size: Option<u32>,
    ) -> Result<()>;

    /// Requires the instance to be stopped.
    async fn modify_vpc_attribute(
        &self,
        instance_id: &str,
        vswitch_id: &str,
        private_ip: Option<&str>,
    ) -> Result<()>;

    /// Requires the instance to be stopped. Throttling-prone: the platform
    /// refuses a second spec change within a few minutes.
    async fn modify_instance_type(&self, instance_id: &str, instance_type: &str) -> Result<()>;

    async fn modify_network_spec(&self, instance_id: &str, change: &NetworkSpecChange)
        -> Result<()>;

    async fn modify_charge_type(&self, instance_id: &str, change: &ChargeTypeChange) -> Result<()>;

    /// Returns the allocated address.
    async fn allocate_public_ip(&self, instance_id: &str) -> Result<String>;

    async fn join_security_groups(&self, instance_id: &str, group_ids: &[String]) -> Result<()>;
    async fn leave_security_groups(&self, instance_id: &str, group_ids: &[String]) -> Result<()>;

    async fn add_tags(&self, instance_id: &str, tags: &TagSet) -> Result<()>;
    async fn remove_tags(&self, instance_id: &str, keys: &[String]) -> Result<()>;
    async fn get_tags(&self, instance_id: &str) -> Result<TagSet>;

    async fn attach_role(&self, instance_id: &str, role_name: &str) -> Result<()>;
    async fn describe_role_attachment(&self, instance_id: &str) -> Result<Option<String>>;
}

pub mod requests {
    use converge_common::{InstanceChargeType, InternetChargeType, PeriodUnit};
    use serde::Serialize;

    /// Live instance attributes. Only `Some` fields are sent.
    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    pub struct AttributeChange {
        pub instance_name: Option<String>,
        pub description: Option<String>,
        pub host_name: Option<String>,
        #[serde(skip_serializing)]
        pub password: Option<String>,
    }

    impl AttributeChange {
        pub fn is_empty(&self) -> bool {
            self.instance_name.is_none()
                && self.description.is_none()
                && self.host_name.is_none()
                && self.password.is_none()
        }
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize)]
    pub struct NetworkSpecChange {
        pub internet_charge_type: Option<InternetChargeType>,
        pub bandwidth_in: Option<u32>,
        pub bandwidth_out: Option<u32>,
    }

    impl NetworkSpecChange {
        pub fn is_empty(&self) -> bool {
            self.internet_charge_type.is_none()
                && self.bandwidth_in.is_none()
                && self.bandwidth_out.is_none()
        }
    }

    #[derive(Clone, Debug, PartialEq, Serialize)]
    pub struct ChargeTypeChange {
        pub charge_type: InstanceChargeType,
        pub period: u32,
        pub period_unit: PeriodUnit,
        pub include_data_disks: bool,
        pub auto_pay: bool,
        pub dry_run: bool,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
