use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_common::{InstanceState, InstanceStatus};
use converge_providers::RemoteApiClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Phase, ReconcileError};
use crate::logger;

/// Polls the platform until an instance reaches a condition.
#[derive(Clone)]
pub struct StateWaiter {
    client: Arc<dyn RemoteApiClient>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl StateWaiter {
    pub fn new(
        client: Arc<dyn RemoteApiClient>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            poll_interval,
            cancel,
        }
    }

    /// Wait until the instance reports `target`.
    pub async fn wait_for_status(
        &self,
        instance_id: &str,
        target: InstanceStatus,
        timeout: Duration,
    ) -> Result<InstanceState, ReconcileError> {
        self.wait_until(instance_id, Phase::Wait(target), timeout, |state| {
            state.status == target
        })
        .await
    }

    /// Wait until a system-disk replacement is visible.
    pub async fn wait_for_image(
        &self,
        instance_id: &str,
        image_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState, ReconcileError> {
        self.wait_until(instance_id, Phase::ConfirmImage, timeout, |state| {
            state.image_id == image_id
        })
        .await
    }

    /// Describe every poll interval until `done` holds.
    ///
    /// NotFound is final: an instance that disappears mid-wait never comes back.
    /// Other describe failures are returned as they are.
    pub async fn wait_until<P>(
        &self,
        instance_id: &str,
        phase: Phase,
        timeout: Duration,
        done: P,
    ) -> Result<InstanceState, ReconcileError>
    where
        P: Fn(&InstanceState) -> bool,
    {
        let started = Instant::now();
        let mut last_status: Option<InstanceStatus> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled { phase });
            }

            let state = self
                .client
                .describe_instance(instance_id)
                .await
                .map_err(|e| ReconcileError::remote(phase, instance_id, e))?;

            if last_status != Some(state.status) {
                if let Some(from) = last_status {
                    log_transition(instance_id, from, state.status, phase);
                }
                last_status = Some(state.status);
            }

            if done(&state) {
                debug!(
                    "✅ [state_machine] {}: {} reached after {:?}",
                    instance_id,
                    phase,
                    started.elapsed()
                );
                return Ok(state);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    "⏱️ [state_machine] {}: {} not reached after {:?} (status {})",
                    instance_id, phase, elapsed, state.status
                );
                return Err(ReconcileError::Timeout {
                    phase,
                    budget: timeout,
                    detail: format!("last observed status {}", state.status),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => {
                    return Err(ReconcileError::Cancelled { phase });
                }
            }
        }
    }
}

fn log_transition(instance_id: &str, from: InstanceStatus, to: InstanceStatus, phase: Phase) {
    info!(
        "🔄 [state_machine] {}: {} -> {} (while waiting: {})",
        instance_id, from, to, phase
    );
    logger::log_transition(instance_id, from.as_str(), to.as_str());
}
