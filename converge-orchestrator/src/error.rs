use std::fmt;
use std::time::Duration;

use converge_common::InstanceStatus;
use converge_providers::{classify_error, ErrorClass};
use thiserror::Error;

use crate::change_set::ChangeKind;
use crate::lifecycle_guard::Violation;

/// Workflow step a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Read,
    Wait(InstanceStatus),
    Start,
    Stop,
    AllocatePublicIp,
    Tags,
    SecurityGroups,
    Attributes,
    Role,
    Apply(ChangeKind),
    ConfirmImage,
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Create => f.write_str("create"),
            Phase::Read => f.write_str("read"),
            Phase::Wait(status) => write!(f, "wait for {}", status),
            Phase::Start => f.write_str("start"),
            Phase::Stop => f.write_str("stop"),
            Phase::AllocatePublicIp => f.write_str("allocate public ip"),
            Phase::Tags => f.write_str("tags"),
            Phase::SecurityGroups => f.write_str("security groups"),
            Phase::Attributes => f.write_str("attributes"),
            Phase::Role => f.write_str("role attachment"),
            Phase::Apply(kind) => write!(f, "apply {}", kind),
            Phase::ConfirmImage => f.write_str("confirm image"),
            Phase::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{phase}: instance '{instance_id}' not found")]
    NotFound { phase: Phase, instance_id: String },

    #[error("{phase}: gave up after {budget:?} ({detail})")]
    Timeout {
        phase: Phase,
        budget: Duration,
        detail: String,
    },

    #[error("business rule violated: {0}")]
    BusinessRule(Violation),

    #[error("invalid declaration: {0}")]
    Validation(Violation),

    #[error("{phase}: {source:#}")]
    Remote {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("{phase}: cancelled")]
    Cancelled { phase: Phase },

    /// Create failed after the platform assigned an id. The entity exists
    /// and must be reconciled or deleted by the caller.
    #[error("instance '{instance_id}' left incomplete: {source}")]
    Incomplete {
        instance_id: String,
        #[source]
        source: Box<ReconcileError>,
    },
}

impl ReconcileError {
    /// Attribute a client failure to `phase`.
    ///
    /// A `ReconcileError` travelling inside the anyhow chain is returned as
    /// is, and platform NotFound codes become [`ReconcileError::NotFound`].
    pub fn remote(phase: Phase, instance_id: &str, error: anyhow::Error) -> Self {
        let error = match error.downcast::<ReconcileError>() {
            Ok(inner) => return inner,
            Err(error) => error,
        };
        if classify_error(&error) == ErrorClass::NotFound {
            return ReconcileError::NotFound {
                phase,
                instance_id: instance_id.to_string(),
            };
        }
        ReconcileError::Remote {
            phase,
            source: error,
        }
    }

    /// The underlying failure, looking through [`ReconcileError::Incomplete`].
    pub fn root(&self) -> &ReconcileError {
        match self {
            ReconcileError::Incomplete { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self.root() {
            ReconcileError::BusinessRule(v) | ReconcileError::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), ReconcileError::NotFound { .. })
    }

    /// Id of an entity that exists remotely despite the failure.
    pub fn orphaned_instance(&self) -> Option<&str> {
        match self {
            ReconcileError::Incomplete { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }
}
