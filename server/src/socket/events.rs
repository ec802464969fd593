use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use socketioxide::{
    SocketIo,
    extract::{AckSender, Data, Extension, SocketRef},
    handler::ConnectHandler,
};
use tracing::{Instrument, Span, debug, info, warn};
use uuid::Uuid;

use loomcast_core::{
    ids::{UserId, WorkspaceId},
    ops::{OperationEnvelope, OperationTarget},
};

use crate::{
    error::AppError,
    pipeline::{self, OperationContext, PipelineOutcome},
    presence::{CursorPosition, Selection, cursor_delta, selection_delta, snapshot_payload},
    registry::JoinDenied,
    socket::{
        ack::{ack_error, ack_ok},
        auth::SocketAuthMiddleware,
        rooms::{workflow_room, workspace_room},
        types::SocketUserContext,
    },
    state::AppState,
};

/// Root span of the connection, parented by the auth middleware so every
/// event span hangs off the same trace.
#[derive(Clone)]
pub(crate) struct SocketRootSpan(pub Span);

pub(crate) fn register_namespace(io: &SocketIo, state: Arc<AppState>) {
    let middleware = SocketAuthMiddleware::new(state);
    let _ = io.ns("/", on_connect.with(middleware));
}

async fn on_connect(socket: SocketRef) {
    socket.on("join-workspace", handle_join_workspace);
    socket.on("leave-workspace", handle_leave_workspace);
    socket.on("join-workflow", handle_join_workflow);
    socket.on("leave-workflow", handle_leave_workflow);
    socket.on("workflow-operation", handle_workflow_operation);
    socket.on("subblock-update", handle_subblock_update);
    socket.on("variable-update", handle_variable_update);
    socket.on("cursor-update", handle_cursor_update);
    socket.on("selection-update", handle_selection_update);
    socket.on("request-sync", handle_request_sync);

    socket.on_disconnect(handle_disconnect);
}

fn start_socket_span(
    event: &'static str,
    socket: &SocketRef,
    user: &SocketUserContext,
    target_id: &str,
) -> Span {
    let root = socket
        .extensions
        .get::<SocketRootSpan>()
        .map(|span| span.0.clone());
    let socket_id = socket.id.to_string();
    let user_id = user.user_id.clone();
    let target_id = target_id.to_string();

    if let Some(parent) = root {
        logfire::span!(
            parent: &parent,
            "socket {event}",
            event = event,
            socket_id = socket_id,
            user_id = user_id,
            target_id = target_id
        )
    } else {
        logfire::span!(
            "socket {event}",
            event = event,
            socket_id = socket_id,
            user_id = user_id,
            target_id = target_id
        )
    }
}

fn emit_to_self(socket: &SocketRef, event: &'static str, payload: &JsonValue) {
    if let Err(err) = socket.emit(event, payload) {
        warn!(?err, event, "failed to emit to socket");
    }
}

async fn broadcast_to_room(socket: &SocketRef, room: String, event: &'static str, payload: &JsonValue) {
    if let Err(err) = socket.broadcast().to(room).emit(event, payload).await {
        warn!(?err, event, "failed to broadcast to room");
    }
}

// ---- workspace rooms ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinWorkspaceRequest {
    workspace_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinWorkspaceResponse {
    workspace_id: String,
    role: &'static str,
    success: bool,
}

async fn handle_join_workspace(
    socket: SocketRef,
    Data(payload): Data<JoinWorkspaceRequest>,
    ack: AckSender,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("join-workspace", &socket, &user, &payload.workspace_id);

    async move {
        let workspace_id = payload.workspace_id;
        info!(workspace_id = %workspace_id, "socket join-workspace received");

        let role = match state
            .permission_store
            .workspace_role(
                &UserId::from(user.user_id.as_str()),
                &WorkspaceId::from(workspace_id.as_str()),
            )
            .await
        {
            Ok(Some(role)) => role,
            Ok(None) => {
                warn!(workspace_id = %workspace_id, "join-workspace denied");
                emit_to_self(
                    &socket,
                    "join-workspace-error",
                    &json!({
                        "workspaceId": workspace_id,
                        "error": "no permission on this workspace",
                    }),
                );
                ack_error::<JoinWorkspaceResponse>(
                    ack,
                    AppError::workspace_access_denied(&workspace_id),
                );
                return;
            }
            Err(err) => {
                ack_error::<JoinWorkspaceResponse>(ack, AppError::from_anyhow(err));
                return;
            }
        };

        let socket_id = socket.id.to_string();
        if let Some(previous) = state
            .registry
            .join_workspace(&socket_id, &user.principal, &workspace_id, role)
        {
            socket.leave(workspace_room(&previous.workspace_id));
        }
        socket.join(workspace_room(&workspace_id));

        emit_to_self(
            &socket,
            "joined-workspace",
            &json!({ "workspaceId": workspace_id, "role": role.as_str() }),
        );
        ack_ok(
            ack,
            JoinWorkspaceResponse {
                workspace_id: workspace_id.clone(),
                role: role.as_str(),
                success: true,
            },
        );

        info!(workspace_id = %workspace_id, role = role.as_str(), "socket join-workspace success");
    }
    .instrument(span)
    .await;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaveResponse {
    success: bool,
}

async fn handle_leave_workspace(
    socket: SocketRef,
    ack: AckSender,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("leave-workspace", &socket, &user, "");

    async move {
        let socket_id = socket.id.to_string();
        if let Some(leave) = state.registry.leave_workspace(&socket_id) {
            socket.leave(workspace_room(&leave.workspace_id));
            emit_to_self(
                &socket,
                "left-workspace",
                &json!({ "workspaceId": leave.workspace_id }),
            );
        }
        ack_ok(ack, LeaveResponse { success: true });
    }
    .instrument(span)
    .await;
}

// ---- workflow rooms ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinWorkflowRequest {
    workflow_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinWorkflowResponse {
    client_id: String,
    workflow_id: String,
    role: &'static str,
    success: bool,
}

async fn handle_join_workflow(
    socket: SocketRef,
    Data(payload): Data<JoinWorkflowRequest>,
    ack: AckSender,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("join-workflow", &socket, &user, &payload.workflow_id);

    async move {
        let workflow_id = payload.workflow_id;
        info!(workflow_id = %workflow_id, "socket join-workflow received");

        let record = match state.workflow_store.find_by_id(&workflow_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                ack_error::<JoinWorkflowResponse>(ack, AppError::workflow_not_found(&workflow_id));
                return;
            }
            Err(err) => {
                ack_error::<JoinWorkflowResponse>(ack, AppError::from_anyhow(err));
                return;
            }
        };

        let role = match state
            .permission_store
            .workspace_role(
                &UserId::from(user.user_id.as_str()),
                &WorkspaceId::from(record.workspace_id.as_str()),
            )
            .await
        {
            Ok(Some(role)) => role,
            Ok(None) => {
                warn!(workflow_id = %workflow_id, "join-workflow denied");
                ack_error::<JoinWorkflowResponse>(
                    ack,
                    AppError::workflow_access_denied(&workflow_id),
                );
                return;
            }
            Err(err) => {
                ack_error::<JoinWorkflowResponse>(ack, AppError::from_anyhow(err));
                return;
            }
        };

        let socket_id = socket.id.to_string();
        let join = match state
            .registry
            .join_workflow(&socket_id, &user.principal, &workflow_id, role)
        {
            Ok(join) => join,
            Err(JoinDenied::Tombstoned) => {
                ack_error::<JoinWorkflowResponse>(ack, AppError::workflow_deleted(&workflow_id));
                return;
            }
        };

        if let Some(previous) = join.previous {
            socket.leave(workflow_room(&previous.workflow_id));
            if !previous.destroyed {
                broadcast_to_room(
                    &socket,
                    workflow_room(&previous.workflow_id),
                    "presence-update",
                    &snapshot_payload(
                        &previous.workflow_id,
                        &previous.remaining,
                        previous.timestamp,
                    ),
                )
                .await;
            }
        }

        socket.join(workflow_room(&workflow_id));
        ack_ok(
            ack,
            JoinWorkflowResponse {
                client_id: socket_id,
                workflow_id: workflow_id.clone(),
                role: role.as_str(),
                success: true,
            },
        );

        let snapshot = snapshot_payload(&workflow_id, &join.snapshot, join.timestamp);
        emit_to_self(&socket, "presence-update", &snapshot);
        broadcast_to_room(&socket, workflow_room(&workflow_id), "presence-update", &snapshot)
            .await;

        info!(
            workflow_id = %workflow_id,
            role = role.as_str(),
            participants = join.snapshot.len(),
            "socket join-workflow success"
        );
    }
    .instrument(span)
    .await;
}

async fn handle_leave_workflow(
    socket: SocketRef,
    ack: AckSender,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("leave-workflow", &socket, &user, "");

    async move {
        let socket_id = socket.id.to_string();
        if let Some(leave) = state.registry.leave_workflow(&socket_id) {
            socket.leave(workflow_room(&leave.workflow_id));
            if !leave.destroyed {
                broadcast_to_room(
                    &socket,
                    workflow_room(&leave.workflow_id),
                    "presence-update",
                    &snapshot_payload(&leave.workflow_id, &leave.remaining, leave.timestamp),
                )
                .await;
            }
            debug!(workflow_id = %leave.workflow_id, "socket left workflow");
        }
        ack_ok(ack, LeaveResponse { success: true });
    }
    .instrument(span)
    .await;
}

// ---- operation pipeline ----

async fn handle_workflow_operation(
    socket: SocketRef,
    Data(envelope): Data<OperationEnvelope>,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("workflow-operation", &socket, &user, &envelope.operation_id);

    async move {
        let socket_id = socket.id.to_string();
        let Some((workflow_id, presence)) = state.registry.presence(&socket_id) else {
            emit_to_self(
                &socket,
                "operation-error",
                &json!({
                    "operationId": envelope.operation_id,
                    "error": AppError::not_in_workflow().to_string(),
                }),
            );
            return;
        };

        let ctx = OperationContext {
            workflow_id: workflow_id.clone(),
            socket_id,
            user_id: user.user_id.clone(),
            role: presence.role,
        };

        state.socket_metrics.inc_operations();
        let outcome =
            pipeline::execute(&state.registry, &state.workflow_store, &ctx, envelope).await;

        match outcome {
            PipelineOutcome::Confirmed {
                operation_id,
                timestamp,
                broadcast,
            } => {
                emit_to_self(
                    &socket,
                    "operation-confirmed",
                    &json!({ "operationId": operation_id, "serverTimestamp": timestamp }),
                );
                broadcast_to_room(
                    &socket,
                    workflow_room(&workflow_id),
                    "workflow-operation",
                    &broadcast,
                )
                .await;
            }
            PipelineOutcome::Forbidden {
                operation_id,
                error,
            } => {
                emit_to_self(
                    &socket,
                    "operation-forbidden",
                    &json!({ "operationId": operation_id, "error": error }),
                );
            }
            PipelineOutcome::Invalid {
                operation_id,
                error,
            } => {
                emit_to_self(
                    &socket,
                    "operation-error",
                    &json!({ "operationId": operation_id, "error": error }),
                );
            }
            PipelineOutcome::Failed {
                operation_id,
                error,
            } => {
                emit_to_self(
                    &socket,
                    "operation-failed",
                    &json!({ "operationId": operation_id, "error": error }),
                );
            }
        }
    }
    .instrument(span)
    .await;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubblockUpdateRequest {
    block_id: String,
    subblock_id: String,
    #[serde(default)]
    value: JsonValue,
}

async fn handle_subblock_update(
    socket: SocketRef,
    Data(payload): Data<SubblockUpdateRequest>,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("subblock-update", &socket, &user, &payload.block_id);

    async move {
        let envelope = OperationEnvelope {
            operation: "update".to_string(),
            target: OperationTarget::Subblock,
            payload: json!({
                "blockId": payload.block_id.clone(),
                "subblockId": payload.subblock_id.clone(),
                "value": payload.value.clone(),
            }),
            operation_id: format!("subblock-{}", Uuid::new_v4().simple()),
            client_timestamp: None,
        };

        if let Some((workflow_id, timestamp)) =
            run_fast_path(&socket, &user, &state, envelope).await
        {
            broadcast_to_room(
                &socket,
                workflow_room(&workflow_id),
                "subblock-update",
                &json!({
                    "blockId": payload.block_id,
                    "subblockId": payload.subblock_id,
                    "value": payload.value,
                    "senderId": socket.id.to_string(),
                    "userId": user.user_id,
                    "timestamp": timestamp,
                }),
            )
            .await;
        }
    }
    .instrument(span)
    .await;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariableUpdateRequest {
    variable_id: String,
    field: String,
    #[serde(default)]
    value: JsonValue,
}

async fn handle_variable_update(
    socket: SocketRef,
    Data(payload): Data<VariableUpdateRequest>,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("variable-update", &socket, &user, &payload.variable_id);

    async move {
        let envelope = OperationEnvelope {
            operation: "update".to_string(),
            target: OperationTarget::Variable,
            payload: json!({
                "id": payload.variable_id.clone(),
                "field": payload.field.clone(),
                "value": payload.value.clone(),
            }),
            operation_id: format!("variable-{}", Uuid::new_v4().simple()),
            client_timestamp: None,
        };

        if let Some((workflow_id, timestamp)) =
            run_fast_path(&socket, &user, &state, envelope).await
        {
            broadcast_to_room(
                &socket,
                workflow_room(&workflow_id),
                "variable-update",
                &json!({
                    "variableId": payload.variable_id,
                    "field": payload.field,
                    "value": payload.value,
                    "senderId": socket.id.to_string(),
                    "userId": user.user_id,
                    "timestamp": timestamp,
                }),
            )
            .await;
        }
    }
    .instrument(span)
    .await;
}

/// The narrow mutation paths share the pipeline but skip the
/// confirm/confirmed envelope; failures surface as `operation-error`.
async fn run_fast_path(
    socket: &SocketRef,
    user: &SocketUserContext,
    state: &AppState,
    envelope: OperationEnvelope,
) -> Option<(String, i64)> {
    let socket_id = socket.id.to_string();
    let Some((workflow_id, presence)) = state.registry.presence(&socket_id) else {
        emit_to_self(
            socket,
            "operation-error",
            &json!({ "error": AppError::not_in_workflow().to_string() }),
        );
        return None;
    };

    let ctx = OperationContext {
        workflow_id: workflow_id.clone(),
        socket_id,
        user_id: user.user_id.clone(),
        role: presence.role,
    };

    state.socket_metrics.inc_operations();
    match pipeline::execute(&state.registry, &state.workflow_store, &ctx, envelope).await {
        PipelineOutcome::Confirmed { timestamp, .. } => Some((workflow_id, timestamp)),
        PipelineOutcome::Forbidden { error, .. } => {
            emit_to_self(socket, "operation-forbidden", &json!({ "error": error }));
            None
        }
        PipelineOutcome::Invalid { error, .. } | PipelineOutcome::Failed { error, .. } => {
            emit_to_self(socket, "operation-error", &json!({ "error": error }));
            None
        }
    }
}

// ---- presence ----

#[derive(Debug, Deserialize)]
struct CursorUpdateRequest {
    x: f64,
    y: f64,
}

async fn handle_cursor_update(
    socket: SocketRef,
    Data(payload): Data<CursorUpdateRequest>,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let socket_id = socket.id.to_string();
    let cursor = CursorPosition {
        x: payload.x,
        y: payload.y,
    };
    if let Some((workflow_id, _)) = state.registry.update_cursor(&socket_id, cursor) {
        broadcast_to_room(
            &socket,
            workflow_room(&workflow_id),
            "cursor-update",
            &cursor_delta(&socket_id, &user.user_id, &cursor),
        )
        .await;
    }
}

async fn handle_selection_update(
    socket: SocketRef,
    Data(selection): Data<Selection>,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let socket_id = socket.id.to_string();
    if let Some((workflow_id, updated)) = state
        .registry
        .update_selection(&socket_id, selection.clone())
    {
        let delta = updated
            .selection
            .as_ref()
            .map(|current| selection_delta(&socket_id, &user.user_id, current))
            .unwrap_or_else(|| selection_delta(&socket_id, &user.user_id, &selection));
        broadcast_to_room(&socket, workflow_room(&workflow_id), "selection-update", &delta).await;
    }
}

// ---- sync ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestSyncRequest {
    workflow_id: String,
}

async fn handle_request_sync(
    socket: SocketRef,
    Data(payload): Data<RequestSyncRequest>,
    ack: AckSender,
    Extension(user): Extension<SocketUserContext>,
    Extension(state): Extension<Arc<AppState>>,
) {
    let span = start_socket_span("request-sync", &socket, &user, &payload.workflow_id);

    async move {
        let socket_id = socket.id.to_string();
        let workflow_id = payload.workflow_id;

        if state.registry.current_workflow(&socket_id).as_deref() != Some(workflow_id.as_str()) {
            ack_error::<JsonValue>(ack, AppError::not_in_workflow());
            return;
        }

        match state.workflow_store.load_state(&workflow_id).await {
            Ok(Some(workflow_state)) => {
                let mut message = match serde_json::to_value(&workflow_state) {
                    Ok(value) => value,
                    Err(err) => {
                        ack_error::<JsonValue>(ack, AppError::from_anyhow(err.into()));
                        return;
                    }
                };
                if let JsonValue::Object(ref mut map) = message {
                    map.insert("workflowId".to_string(), json!(workflow_id));
                }

                emit_to_self(&socket, "workflow-state", &message);
                ack_ok(ack, json!({ "success": true }));
                info!(workflow_id = %workflow_id, "workflow state re-synced");
            }
            Ok(None) => {
                ack_error::<JsonValue>(ack, AppError::workflow_not_found(&workflow_id));
            }
            Err(err) => {
                ack_error::<JsonValue>(ack, AppError::from_anyhow(err));
            }
        }
    }
    .instrument(span)
    .await;
}

// ---- teardown ----

async fn handle_disconnect(socket: SocketRef, Extension(state): Extension<Arc<AppState>>) {
    let socket_id = socket.id.to_string();
    socket.extensions.remove::<SocketRootSpan>();

    let cleanup = state.registry.disconnect(&socket_id);
    if let Some(leave) = cleanup.workflow {
        if !leave.destroyed {
            state.emit_to_room(
                workflow_room(&leave.workflow_id),
                "presence-update",
                snapshot_payload(&leave.workflow_id, &leave.remaining, leave.timestamp),
            );
        }
    }

    state.socket_metrics.dec_connections();
    debug!(socket_id = %socket_id, "socket disconnected");
}
