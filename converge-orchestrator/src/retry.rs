use std::future::Future;
use std::time::{Duration, Instant};

use converge_providers::error::{has_code, ROLE_ATTACHMENT_UNEXPECTED_JSON};
use converge_providers::{classify_error, ErrorClass};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Phase, ReconcileError};

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Transient,
    Fatal,
    NotFound,
}

pub type Classifier = fn(&anyhow::Error) -> Disposition;

#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Total time allowed across attempts.
    pub budget: Duration,
    /// Fixed pause between attempts.
    pub interval: Duration,
    pub classify: Classifier,
}

impl RetryPolicy {
    pub fn new(budget: Duration, interval: Duration, classify: Classifier) -> Self {
        Self {
            budget,
            interval,
            classify,
        }
    }
}

fn from_class(class: ErrorClass, transient: &[ErrorClass]) -> Disposition {
    match class {
        ErrorClass::NotFound => Disposition::NotFound,
        c if transient.contains(&c) => Disposition::Transient,
        _ => Disposition::Fatal,
    }
}

/// Only throttling is retried.
pub fn throttling_only(error: &anyhow::Error) -> Disposition {
    from_class(classify_error(error), &[ErrorClass::Throttling])
}

/// Throttling and platform-side internal errors are retried.
pub fn platform_transient(error: &anyhow::Error) -> Disposition {
    from_class(
        classify_error(error),
        &[ErrorClass::Throttling, ErrorClass::InternalTransient],
    )
}

/// The role-attachment describe sometimes answers with an unparseable body.
pub fn role_attachment(error: &anyhow::Error) -> Disposition {
    if has_code(error, ROLE_ATTACHMENT_UNEXPECTED_JSON) {
        return Disposition::Transient;
    }
    platform_transient(error)
}

/// Retry everything except lifecycle verdicts and cancellation.
pub fn unless_rejected(error: &anyhow::Error) -> Disposition {
    if let Some(err) = error.downcast_ref::<ReconcileError>() {
        return match err {
            ReconcileError::BusinessRule(_)
            | ReconcileError::Validation(_)
            | ReconcileError::Cancelled { .. } => Disposition::Fatal,
            ReconcileError::NotFound { .. } => Disposition::NotFound,
            _ => Disposition::Transient,
        };
    }
    match classify_error(error) {
        ErrorClass::NotFound => Disposition::NotFound,
        _ => Disposition::Transient,
    }
}

/// Runs an operation until it succeeds, fails for good, or the policy budget
/// runs out. Sleeps are interrupted by the cancellation token.
#[derive(Clone)]
pub struct RetryExecutor {
    cancel: CancellationToken,
}

impl RetryExecutor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub async fn run<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        phase: Phase,
        instance_id: &str,
        mut operation: F,
    ) -> Result<T, ReconcileError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled { phase });
            }
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ [retry] {} on {} succeeded after {} attempts", phase, instance_id, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            match (policy.classify)(&error) {
                Disposition::Fatal | Disposition::NotFound => {
                    return Err(ReconcileError::remote(phase, instance_id, error));
                }
                Disposition::Transient => {}
            }

            let elapsed = started.elapsed();
            if elapsed + policy.interval > policy.budget {
                warn!(
                    "⏱️ [retry] {} on {} exhausted after {} attempts in {:?}: {:#}",
                    phase, instance_id, attempt, elapsed, error
                );
                return Err(ReconcileError::Timeout {
                    phase,
                    budget: policy.budget,
                    detail: format!("{} attempts, last error: {:#}", attempt, error),
                });
            }

            warn!(
                "⚠️ [retry] {} on {} attempt {} failed, retrying in {:?}: {:#}",
                phase, instance_id, attempt, policy.interval, error
            );
            tokio::select! {
                _ = tokio::time::sleep(policy.interval) => {}
                _ = self.cancel.cancelled() => {
                    return Err(ReconcileError::Cancelled { phase });
                }
            }
        }
    }
}
