use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use loomcast_core::permission::WorkspaceRole;

use crate::presence::snapshot_payload;
use crate::socket::rooms::{workflow_room, workspace_room};
use crate::state::AppState;

/// Permission-change notification from the application tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChange {
    pub user_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub new_role: Option<String>,
    #[serde(default)]
    pub is_removed: bool,
}

/// Applies a permission downgrade or revocation to every connection of the
/// user inside the workspace. The sockets stay open; clients are expected to
/// navigate away on `permission-revoked`.
pub async fn handle_permission_change(
    state: &AppState,
    change: &PermissionChange,
) -> Result<(), String> {
    let new_role = match change.new_role.as_deref() {
        Some(raw) => Some(
            WorkspaceRole::parse(raw).ok_or_else(|| format!("unknown role '{raw}'"))?,
        ),
        None => None,
    };

    let sockets = state
        .registry
        .user_sockets_in_workspace(&change.user_id, &change.workspace_id);

    if sockets.is_empty() {
        return Ok(());
    }

    if change.is_removed || new_role.is_none() {
        revoke(state, change, &sockets).await;
        return Ok(());
    }

    let new_role = new_role.unwrap_or(WorkspaceRole::Read);
    for socket_id in &sockets {
        let old_role = state
            .registry
            .workspace_membership(socket_id)
            .map(|membership| membership.role);
        state.registry.set_workspace_role(socket_id, new_role);

        state
            .emit_to_room_now(
                socket_id.clone(),
                "permission-changed",
                json!({
                    "workspaceId": change.workspace_id,
                    "oldRole": old_role.map(|role| role.as_str()),
                    "newRole": new_role.as_str(),
                }),
            )
            .await;

        if let Some((workflow_id, snapshot)) =
            state.registry.set_presence_role(socket_id, new_role)
        {
            let timestamp = state.registry.next_timestamp(&workflow_id);
            state
                .emit_to_room_now(
                    workflow_room(&workflow_id),
                    "presence-update",
                    snapshot_payload(&workflow_id, &snapshot, timestamp),
                )
                .await;
        }
    }

    info!(
        user_id = %change.user_id,
        workspace_id = %change.workspace_id,
        new_role = new_role.as_str(),
        affected = sockets.len(),
        "applied permission change"
    );
    Ok(())
}

async fn revoke(state: &AppState, change: &PermissionChange, sockets: &[String]) {
    for socket_id in sockets {
        state
            .emit_to_room_now(
                socket_id.clone(),
                "permission-revoked",
                json!({ "workspaceId": change.workspace_id }),
            )
            .await;

        if let Some(leave) = state.registry.leave_workflow(socket_id) {
            detach_socket_from_room(state, socket_id, &workflow_room(&leave.workflow_id));
            if !leave.destroyed {
                state
                    .emit_to_room_now(
                        workflow_room(&leave.workflow_id),
                        "presence-update",
                        snapshot_payload(&leave.workflow_id, &leave.remaining, leave.timestamp),
                    )
                    .await;
            }
        }

        if let Some(leave) = state.registry.leave_workspace(socket_id) {
            detach_socket_from_room(state, socket_id, &workspace_room(&leave.workspace_id));
        }
    }

    info!(
        user_id = %change.user_id,
        workspace_id = %change.workspace_id,
        affected = sockets.len(),
        "revoked workspace access"
    );
}

/// Workflow deletion: notify the room, then tear it down and tombstone the
/// id so a re-join racing the notice is denied.
pub async fn handle_workflow_deleted(state: &AppState, workflow_id: &str) {
    let timestamp = state.registry.next_timestamp(workflow_id);
    let room = workflow_room(workflow_id);

    state
        .emit_to_room_now(
            room.clone(),
            "workflow-deleted",
            json!({ "workflowId": workflow_id, "timestamp": timestamp }),
        )
        .await;

    let evicted = state.registry.remove_workflow_room(workflow_id);
    for socket_id in &evicted {
        detach_socket_from_room(state, socket_id, &room);
    }

    if !evicted.is_empty() {
        info!(
            workflow_id = %workflow_id,
            evicted = evicted.len(),
            "workflow room torn down after deletion"
        );
    }
}

fn detach_socket_from_room(state: &AppState, socket_id: &str, room: &str) {
    let Some(io) = state.socket_io.get() else {
        return;
    };
    let Some(ns) = io.of("/") else {
        return;
    };
    for socket in ns.sockets() {
        if socket.id.to_string() == socket_id {
            socket.leave(room.to_string());
            return;
        }
    }
    warn!(socket_id, room, "socket not found while detaching from room");
}
