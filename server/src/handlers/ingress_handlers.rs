// Trusted ingress from the application tier. These endpoints assume
// network-level trust (loopback or private network); there is no
// per-request auth. Bodies are parsed by hand so a malformed payload maps
// to the 500 contract instead of an extractor rejection.

use axum::{Json, body::Bytes, extract::State};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::info;

use crate::{
    error::AppError,
    eviction::{self, PermissionChange},
    fanout::{self, ResourceChange},
    socket::rooms::workflow_room,
    state::AppState,
    types::{CopilotEditNotice, SuccessResponse, WorkflowNotice},
};

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::internal(anyhow::anyhow!("malformed ingress body: {err}")))
}

fn ok() -> Json<SuccessResponse> {
    Json(SuccessResponse { success: true })
}

pub(crate) async fn workflow_deleted_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let notice: WorkflowNotice = parse_body(&body)?;
    info!(workflow_id = %notice.workflow_id, "workflow deletion notice received");
    eviction::handle_workflow_deleted(&state, &notice.workflow_id).await;
    Ok(ok())
}

pub(crate) async fn workflow_updated_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let notice: WorkflowNotice = parse_body(&body)?;
    let timestamp = state.registry.next_timestamp(&notice.workflow_id);
    state
        .emit_to_room_now(
            workflow_room(&notice.workflow_id),
            "workflow-updated",
            json!({ "workflowId": notice.workflow_id, "timestamp": timestamp }),
        )
        .await;
    Ok(ok())
}

pub(crate) async fn workflow_reverted_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let notice: WorkflowNotice = parse_body(&body)?;
    let timestamp = state.registry.next_timestamp(&notice.workflow_id);
    info!(workflow_id = %notice.workflow_id, "workflow revert notice received");
    state
        .emit_to_room_now(
            workflow_room(&notice.workflow_id),
            "workflow-reverted",
            json!({ "workflowId": notice.workflow_id, "timestamp": timestamp }),
        )
        .await;
    Ok(ok())
}

pub(crate) async fn copilot_workflow_edit_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let notice: CopilotEditNotice = parse_body(&body)?;
    let timestamp = state.registry.next_timestamp(&notice.workflow_id);
    state
        .emit_to_room_now(
            workflow_room(&notice.workflow_id),
            "copilot-workflow-edit",
            json!({
                "workflowId": notice.workflow_id,
                "description": notice.description,
                "timestamp": timestamp,
            }),
        )
        .await;
    Ok(ok())
}

pub(crate) async fn permission_changed_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let change: PermissionChange = parse_body(&body)?;
    eviction::handle_permission_change(&state, &change)
        .await
        .map_err(AppError::bad_request)?;
    Ok(ok())
}

pub(crate) async fn workspace_resource_changed_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, AppError> {
    let change: ResourceChange = parse_body(&body)?;
    fanout::dispatch(&state, &change)
        .await
        .map_err(AppError::bad_request)?;
    Ok(ok())
}
