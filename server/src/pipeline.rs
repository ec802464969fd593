use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use loomcast_core::{
    ops::{OperationEnvelope, WorkflowOperation},
    permission::WorkspaceRole,
    workflow_store::{ApplyError, WorkflowStore},
};

use crate::registry::RoomRegistry;

/// Everything the pipeline needs to know about the originator. The role is
/// the one cached at join time; a permission change mid-flight does not
/// affect an operation already past authorization.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub workflow_id: String,
    pub socket_id: String,
    pub user_id: String,
    pub role: WorkspaceRole,
}

/// Outcome of one mutation request. The socket layer maps each variant to
/// its wire event; only `Confirmed` carries a room broadcast.
#[derive(Debug)]
pub enum PipelineOutcome {
    Confirmed {
        operation_id: String,
        timestamp: i64,
        broadcast: JsonValue,
    },
    Forbidden {
        operation_id: String,
        error: String,
    },
    Invalid {
        operation_id: String,
        error: String,
    },
    Failed {
        operation_id: String,
        error: String,
    },
}

pub async fn execute(
    registry: &RoomRegistry,
    store: &WorkflowStore,
    ctx: &OperationContext,
    envelope: OperationEnvelope,
) -> PipelineOutcome {
    let operation_id = envelope.operation_id.clone();

    // 1. Authorize against the role cached at join time.
    if !ctx.role.can_edit() {
        return PipelineOutcome::Forbidden {
            operation_id,
            error: format!(
                "role '{}' cannot modify workflow {}",
                ctx.role, ctx.workflow_id
            ),
        };
    }

    // 2. Structural validation of the (target, operation) pair.
    let operation = match WorkflowOperation::parse(&envelope) {
        Ok(operation) => operation,
        Err(err) => {
            debug!(
                workflow_id = %ctx.workflow_id,
                operation_id = %operation_id,
                error = %err,
                "operation failed validation"
            );
            return PipelineOutcome::Invalid {
                operation_id,
                error: err.to_string(),
            };
        }
    };

    // 3. Serialize per workflow: one operation at a time per room, so every
    // observer sees the same total order. The guard stays held across the
    // durable commit; it is not the membership lock.
    let gate = registry.op_lock(&ctx.workflow_id);
    let _guard = match gate.as_ref() {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let timestamp = registry.next_timestamp(&ctx.workflow_id);

    // 4. Apply. Intermediate drag positions are broadcast-only.
    if operation.requires_persistence() {
        if let Err(err) = store.apply(&ctx.workflow_id, &operation, timestamp).await {
            return match err {
                ApplyError::WorkflowNotFound(_) | ApplyError::Conflict(_) => {
                    debug!(
                        workflow_id = %ctx.workflow_id,
                        operation_id = %operation_id,
                        error = %err,
                        "operation rejected by the store"
                    );
                    PipelineOutcome::Failed {
                        operation_id,
                        error: err.to_string(),
                    }
                }
                ApplyError::Internal(error) => {
                    warn!(
                        workflow_id = %ctx.workflow_id,
                        operation_id = %operation_id,
                        ?error,
                        "operation hit an internal fault"
                    );
                    PipelineOutcome::Failed {
                        operation_id,
                        error: "internal error while applying the operation".to_string(),
                    }
                }
            };
        }
    }

    // 5. The broadcast replays the client's own payload so remote mirrors
    // apply the identical mutation; emitted after the durable commit.
    let broadcast = json!({
        "operation": envelope.operation,
        "target": envelope.target,
        "payload": envelope.payload,
        "operationId": operation_id,
        "senderId": ctx.socket_id,
        "userId": ctx.user_id,
        "timestamp": timestamp,
    });

    registry.bump_last_modified(&ctx.workflow_id, timestamp);

    PipelineOutcome::Confirmed {
        operation_id,
        timestamp,
        broadcast,
    }
}
