use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

/// Action log lines share this target so they can be filtered apart from
/// diagnostic output (`RUST_LOG=action_log=info`).
pub const ACTION_LOG_TARGET: &str = "action_log";

/// Log the start of an action; the returned id ties it to its completion.
pub fn log_event(
    action_type: &str,
    status: &str,
    instance_id: Option<&str>,
    error_message: Option<&str>,
) -> Uuid {
    log_event_with_metadata(action_type, status, instance_id, error_message, None)
}

/// Log event with metadata (context info)
pub fn log_event_with_metadata(
    action_type: &str,
    status: &str,
    instance_id: Option<&str>,
    error_message: Option<&str>,
    metadata: Option<Value>,
) -> Uuid {
    let log_id = Uuid::new_v4();
    let metadata = metadata.unwrap_or(Value::Null);

    info!(
        target: ACTION_LOG_TARGET,
        %log_id,
        action_type,
        status,
        instance_id = instance_id.unwrap_or("-"),
        error_message = error_message.unwrap_or(""),
        %metadata,
        "📝 [Reconciler] Logged: {} - {} ({})",
        action_type,
        status,
        log_id
    );
    log_id
}

/// Log event completion with duration
pub fn log_event_complete(
    log_id: Uuid,
    action_type: &str,
    status: &str,
    duration_ms: u64,
    error_message: Option<&str>,
) {
    match error_message {
        Some(message) => error!(
            target: ACTION_LOG_TARGET,
            %log_id,
            action_type,
            status,
            duration_ms,
            error_message = message,
            "❌ [Reconciler] {} {} after {}ms: {}",
            action_type,
            status,
            duration_ms,
            message
        ),
        None => info!(
            target: ACTION_LOG_TARGET,
            %log_id,
            action_type,
            status,
            duration_ms,
            "✅ [Reconciler] {} {} in {}ms",
            action_type,
            status,
            duration_ms
        ),
    }
}

/// Quick log for one-off events (like state transitions)
pub fn log_transition(instance_id: &str, from_status: &str, to_status: &str) {
    let log_id = log_event_with_metadata(
        "STATE_TRANSITION",
        "success",
        Some(instance_id),
        None,
        Some(serde_json::json!({ "from": from_status, "to": to_status })),
    );
    log_event_complete(log_id, "STATE_TRANSITION", "success", 0, None);
}
