use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use loomcast_core::permission::WorkspaceRole;
use loomcast_core::token::SessionPrincipal;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionKind {
    Block,
    Edge,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(rename = "type")]
    pub kind: SelectionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Live metadata about one participant of a workflow room. Owned by the
/// room; connections only hold ids into the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub socket_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub joined_at: i64,
    pub last_activity: i64,
    pub role: WorkspaceRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

impl Presence {
    pub fn new(
        socket_id: &str,
        principal: &SessionPrincipal,
        role: WorkspaceRole,
        joined_at: i64,
    ) -> Self {
        Self {
            socket_id: socket_id.to_owned(),
            user_id: principal.user_id.to_string(),
            user_name: principal.name.clone(),
            avatar_url: principal.avatar_url.clone(),
            joined_at,
            last_activity: joined_at,
            role,
            cursor: None,
            selection: None,
        }
    }
}

/// Full snapshot sent on every membership or role change so late joiners and
/// reconnectors converge without diffs.
pub fn snapshot_payload(workflow_id: &str, users: &[Presence], timestamp: i64) -> JsonValue {
    json!({
        "workflowId": workflow_id,
        "users": users,
        "timestamp": timestamp,
    })
}

pub fn cursor_delta(socket_id: &str, user_id: &str, cursor: &CursorPosition) -> JsonValue {
    json!({
        "socketId": socket_id,
        "userId": user_id,
        "cursor": cursor,
    })
}

pub fn selection_delta(socket_id: &str, user_id: &str, selection: &Selection) -> JsonValue {
    json!({
        "socketId": socket_id,
        "userId": user_id,
        "selection": selection,
    })
}
