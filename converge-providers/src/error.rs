//! Platform error classification.
//!
//! Client implementations return [`ApiError`] inside an `anyhow::Error`;
//! [`classify_error`] maps it onto the four classes the reconciler reasons
//! about, using the platform error code only.

use thiserror::Error;

/// Error returned by the remote control plane.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(instance_id: &str) -> Self {
        Self::new(
            "InvalidInstanceId.NotFound",
            format!("The specified instance '{}' does not exist", instance_id),
        )
    }

    pub fn throttled() -> Self {
        Self::new("Throttling", "Request was denied due to request throttling")
    }

    pub fn internal() -> Self {
        Self::new("InternalError", "The request processing has failed due to some unknown error")
    }

    pub fn incorrect_status(instance_id: &str, status: &str) -> Self {
        Self::new(
            INCORRECT_STATUS_CODE,
            format!("The current status of instance '{}' ({}) does not support this action", instance_id, status),
        )
    }

    pub fn class(&self) -> ErrorClass {
        classify_code(&self.code)
    }
}

/// Error categories for retry and lifecycle decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Entity does not exist
    NotFound,
    /// Request-rate limit hit
    Throttling,
    /// Platform-side transient failure
    InternalTransient,
    /// Anything else; never retried
    Fatal,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorClass::Throttling | ErrorClass::InternalTransient)
    }
}

/// Known codes for "instance does not exist"
const NOT_FOUND_CODES: &[&str] = &["InvalidInstanceId.NotFound", "Forbidden.InstanceNotFound"];

/// Known codes for throttling
const THROTTLING_CODES: &[&str] = &["Throttling", "Throttling.User", "ServiceUnavailable"];

/// Known codes for platform-side transient failures
const INTERNAL_CODES: &[&str] = &["InternalError", "UnknownError"];

pub const INCORRECT_STATUS_CODE: &str = "IncorrectInstanceStatus";

/// Returned by the role-attachment describe call when the platform answers
/// with a body it cannot parse. Fatal everywhere except that one call.
pub const ROLE_ATTACHMENT_UNEXPECTED_JSON: &str = "UnexpectedJson";

pub fn classify_code(code: &str) -> ErrorClass {
    if NOT_FOUND_CODES.contains(&code) {
        ErrorClass::NotFound
    } else if THROTTLING_CODES.contains(&code) {
        ErrorClass::Throttling
    } else if INTERNAL_CODES.contains(&code) {
        ErrorClass::InternalTransient
    } else {
        ErrorClass::Fatal
    }
}

/// First [`ApiError`] in the chain, if any.
pub fn api_error(error: &anyhow::Error) -> Option<&ApiError> {
    error.chain().find_map(|cause| cause.downcast_ref::<ApiError>())
}

/// Classify an error coming out of a [`RemoteApiClient`](crate::RemoteApiClient) call.
/// Errors that carry no [`ApiError`] (transport bugs, decoding) are Fatal.
pub fn classify_error(error: &anyhow::Error) -> ErrorClass {
    api_error(error)
        .map(ApiError::class)
        .unwrap_or(ErrorClass::Fatal)
}

/// True when the chain carries the given platform code.
pub fn has_code(error: &anyhow::Error, code: &str) -> bool {
    api_error(error).map(|e| e.code == code).unwrap_or(false)
}
