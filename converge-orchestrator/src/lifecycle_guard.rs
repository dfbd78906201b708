//! Platform rules checked before any mutation is sent.

use std::fmt;

use converge_common::{InstanceChargeType, InstanceSpec, InstanceState};
use thiserror::Error;

use crate::change_set::ChangeSet;
use crate::error::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Prepaid instances are released by the billing system, not deleted.
    DeleteWhilePrepaid,
    /// Prepaid cannot be converted back to pay-as-you-go.
    ChargeTypeRegression,
    /// Spec changes on Prepaid instances go through a different workflow.
    TypeChangeWhilePrepaid,
    /// Disk size only changes together with the image.
    DiskSizeOnlyChange,
    /// Role attachment needs a VPC instance.
    RoleRequiresVpc,
    /// A VPC instance cannot leave its vswitch without naming a new one.
    VpcAttributeWithoutTarget,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::DeleteWhilePrepaid => "delete-while-prepaid",
            Rule::ChargeTypeRegression => "charge-type-regression",
            Rule::TypeChangeWhilePrepaid => "type-change-while-prepaid",
            Rule::DiskSizeOnlyChange => "disk-size-only-change",
            Rule::RoleRequiresVpc => "role-requires-vpc",
            Rule::VpcAttributeWithoutTarget => "vpc-attribute-without-target",
        }
    }

    /// Declaration problems rather than platform lifecycle rules.
    pub fn is_validation(&self) -> bool {
        matches!(self, Rule::RoleRequiresVpc | Rule::VpcAttributeWithoutTarget)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{rule}: {detail}")]
pub struct Violation {
    pub rule: Rule,
    pub detail: String,
}

impl Violation {
    pub fn new(rule: Rule, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

impl From<Violation> for ReconcileError {
    fn from(violation: Violation) -> Self {
        if violation.rule.is_validation() {
            ReconcileError::Validation(violation)
        } else {
            ReconcileError::BusinessRule(violation)
        }
    }
}

/// Rules that only depend on the declaration.
pub fn check_declaration(desired: &InstanceSpec) -> Result<(), Violation> {
    if let Some(role) = desired.role_name() {
        if !desired.is_vpc() {
            return Err(Violation::new(
                Rule::RoleRequiresVpc,
                format!("role '{}' declared for an instance without vswitch", role),
            ));
        }
    }
    Ok(())
}

/// Rules for an update, given the fresh observation and the computed diff.
pub fn check_update(
    desired: &InstanceSpec,
    observed: &InstanceState,
    changes: &ChangeSet,
) -> Result<(), Violation> {
    check_declaration(desired)?;

    if observed.charge_type == InstanceChargeType::PrePaid
        && desired.billing.charge_type == InstanceChargeType::PostPaid
    {
        return Err(Violation::new(
            Rule::ChargeTypeRegression,
            format!(
                "instance '{}' is PrePaid and cannot become PostPaid",
                observed.instance_id
            ),
        ));
    }

    if let Some((from, to)) = &changes.instance_type {
        if observed.charge_type == InstanceChargeType::PrePaid {
            return Err(Violation::new(
                Rule::TypeChangeWhilePrepaid,
                format!(
                    "instance '{}' is PrePaid; cannot change type {} -> {}",
                    observed.instance_id, from, to
                ),
            ));
        }
    }

    if let Some((from, to)) = changes.system_disk_size {
        if changes.image.is_none() {
            return Err(Violation::new(
                Rule::DiskSizeOnlyChange,
                format!(
                    "system disk size {} -> {} GB requires an image change",
                    from, to
                ),
            ));
        }
    }

    if let Some(vpc) = &changes.vpc {
        if vpc.vswitch_id.is_empty() {
            return Err(Violation::new(
                Rule::VpcAttributeWithoutTarget,
                format!(
                    "instance '{}' is attached to '{}'; a target vswitch is required",
                    observed.instance_id, observed.vswitch_id
                ),
            ));
        }
    }

    Ok(())
}

/// Delete is refused for Prepaid instances.
pub fn check_delete(instance_id: &str, charge_type: InstanceChargeType) -> Result<(), Violation> {
    if charge_type == InstanceChargeType::PrePaid {
        return Err(Violation::new(
            Rule::DeleteWhilePrepaid,
            format!("instance '{}' is PrePaid and is released when it expires", instance_id),
        ));
    }
    Ok(())
}
