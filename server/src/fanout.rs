use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, info};

use crate::socket::rooms::workspace_room;
use crate::state::AppState;

/// Resource-change notification from the application tier.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChange {
    pub workspace_id: String,
    pub resource_type: ResourceType,
    pub operation: ResourceOperation,
    #[serde(default)]
    pub data: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Env,
    Tools,
    Folders,
    Mcp,
    Workflows,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Env => "env",
            ResourceType::Tools => "tools",
            ResourceType::Folders => "folders",
            ResourceType::Mcp => "mcp",
            ResourceType::Workflows => "workflows",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceOperation {
    Create,
    Update,
    Delete,
}

impl ResourceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOperation::Create => "create",
            ResourceOperation::Update => "update",
            ResourceOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct FanoutEvent {
    pub event: &'static str,
    pub payload: JsonValue,
}

/// The `(resourceType, operation)` → event-name mapping is the wire
/// contract. Create and delete are never collapsed into update; env is the
/// one exception, where update and delete both land on
/// `workspace-env-updated`.
pub fn event_name(
    resource_type: ResourceType,
    operation: ResourceOperation,
) -> Option<&'static str> {
    use ResourceOperation::*;
    use ResourceType::*;

    match (resource_type, operation) {
        (Env, Update) | (Env, Delete) => Some("workspace-env-updated"),
        (Env, Create) => None,
        (Tools, Create) => Some("workspace-tool-created"),
        (Tools, Update) => Some("workspace-tool-updated"),
        (Tools, Delete) => Some("workspace-tool-deleted"),
        (Folders, Create) => Some("workspace-folder-created"),
        (Folders, Update) => Some("workspace-folder-updated"),
        (Folders, Delete) => Some("workspace-folder-deleted"),
        (Mcp, Create) => Some("workspace-mcp-created"),
        (Mcp, Update) => Some("workspace-mcp-updated"),
        (Mcp, Delete) => Some("workspace-mcp-deleted"),
        (Workflows, Create) => Some("workspace-workflow-created"),
        (Workflows, Update) => Some("workspace-workflow-updated"),
        (Workflows, Delete) => Some("workspace-workflow-deleted"),
    }
}

/// Expands one notification into the events to emit. Folder-cascade
/// workflow deletions arrive with a `workflows` array and fan out one event
/// per affected workflow.
pub fn plan(change: &ResourceChange) -> Result<Vec<FanoutEvent>, String> {
    let Some(event) = event_name(change.resource_type, change.operation) else {
        return Err(format!(
            "operation '{}' is not valid for resource type '{}'",
            change.operation.as_str(),
            change.resource_type.as_str()
        ));
    };

    let timestamp = Utc::now().timestamp_millis();

    if change.resource_type == ResourceType::Workflows
        && change.operation == ResourceOperation::Delete
    {
        if let Some(entries) = change.data.get("workflows").and_then(JsonValue::as_array) {
            return Ok(entries
                .iter()
                .map(|entry| FanoutEvent {
                    event,
                    payload: envelope(change, entry.clone(), timestamp),
                })
                .collect());
        }
    }

    let data = match change.resource_type {
        // Environment values never leave the server; only key names fan out.
        ResourceType::Env => {
            let keys = change
                .data
                .get("keys")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            json!({ "keys": keys })
        }
        _ => change.data.clone(),
    };

    Ok(vec![FanoutEvent {
        event,
        payload: envelope(change, data, timestamp),
    }])
}

fn envelope(change: &ResourceChange, data: JsonValue, timestamp: i64) -> JsonValue {
    let mut map = match data {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    map.insert(
        "workspaceId".to_string(),
        json!(change.workspace_id.clone()),
    );
    map.insert(
        "operation".to_string(),
        json!(change.operation.as_str()),
    );
    map.insert("timestamp".to_string(), json!(timestamp));
    JsonValue::Object(map)
}

/// Emits the planned events to the workspace room, in order. Best effort:
/// failures are logged and never propagate to clients or the application
/// tier.
pub async fn dispatch(state: &AppState, change: &ResourceChange) -> Result<usize, String> {
    let events = plan(change)?;
    let room = workspace_room(&change.workspace_id);

    if state.registry.workspace_sockets(&change.workspace_id).is_empty() {
        debug!(
            workspace_id = %change.workspace_id,
            resource_type = change.resource_type.as_str(),
            "workspace room empty; resource event dropped"
        );
        return Ok(0);
    }

    let count = events.len();
    for FanoutEvent { event, payload } in events {
        state.socket_metrics.inc_fanout_events();
        state.emit_to_room_now(room.clone(), event, payload).await;
    }

    if count > 1 {
        info!(
            workspace_id = %change.workspace_id,
            count,
            "cascade fanout emitted multiple workflow events"
        );
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(
        resource_type: ResourceType,
        operation: ResourceOperation,
        data: JsonValue,
    ) -> ResourceChange {
        ResourceChange {
            workspace_id: "ws-1".to_string(),
            resource_type,
            operation,
            data,
        }
    }

    #[test]
    fn mapping_table_is_exhaustive() {
        use ResourceOperation::*;
        use ResourceType::*;

        let cases = [
            (Env, Update, Some("workspace-env-updated")),
            (Env, Delete, Some("workspace-env-updated")),
            (Env, Create, None),
            (Tools, Create, Some("workspace-tool-created")),
            (Tools, Update, Some("workspace-tool-updated")),
            (Tools, Delete, Some("workspace-tool-deleted")),
            (Folders, Create, Some("workspace-folder-created")),
            (Folders, Update, Some("workspace-folder-updated")),
            (Folders, Delete, Some("workspace-folder-deleted")),
            (Mcp, Create, Some("workspace-mcp-created")),
            (Mcp, Update, Some("workspace-mcp-updated")),
            (Mcp, Delete, Some("workspace-mcp-deleted")),
            (Workflows, Create, Some("workspace-workflow-created")),
            (Workflows, Update, Some("workspace-workflow-updated")),
            (Workflows, Delete, Some("workspace-workflow-deleted")),
        ];

        for (resource_type, operation, expected) in cases {
            assert_eq!(event_name(resource_type, operation), expected);
        }
    }

    #[test]
    fn env_payload_carries_keys_only() {
        let events = plan(&change(
            ResourceType::Env,
            ResourceOperation::Update,
            json!({
                "keys": ["API_KEY", "DB_URL"],
                "values": {"API_KEY": "sk-secret", "DB_URL": "postgres://"}
            }),
        ))
        .expect("plan env update");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "workspace-env-updated");
        assert_eq!(events[0].payload["keys"], json!(["API_KEY", "DB_URL"]));
        assert!(events[0].payload.get("values").is_none());
        assert_eq!(events[0].payload["workspaceId"], "ws-1");
        assert_eq!(events[0].payload["operation"], "update");
    }

    #[test]
    fn env_create_is_rejected() {
        let err = plan(&change(
            ResourceType::Env,
            ResourceOperation::Create,
            json!({"keys": []}),
        ))
        .expect_err("env create invalid");
        assert!(err.contains("env"));
    }

    #[test]
    fn folder_delete_keeps_deletion_stats() {
        let events = plan(&change(
            ResourceType::Folders,
            ResourceOperation::Delete,
            json!({
                "folderId": "f1",
                "deletionStats": {"folders": 1, "workflows": 2}
            }),
        ))
        .expect("plan folder delete");

        assert_eq!(events[0].event, "workspace-folder-deleted");
        assert_eq!(events[0].payload["folderId"], "f1");
        assert_eq!(events[0].payload["deletionStats"]["workflows"], 2);
    }

    #[test]
    fn workflow_cascade_emits_one_event_per_workflow() {
        let events = plan(&change(
            ResourceType::Workflows,
            ResourceOperation::Delete,
            json!({
                "workflows": [
                    {"workflowId": "wf-2", "folderId": "f1"},
                    {"workflowId": "wf-3", "folderId": "f1"}
                ]
            }),
        ))
        .expect("plan cascade");

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event == "workspace-workflow-deleted"));
        assert_eq!(events[0].payload["workflowId"], "wf-2");
        assert_eq!(events[1].payload["workflowId"], "wf-3");
        assert_eq!(events[1].payload["operation"], "delete");
    }

    #[test]
    fn single_workflow_delete_is_one_event() {
        let events = plan(&change(
            ResourceType::Workflows,
            ResourceOperation::Delete,
            json!({"workflowId": "wf-9"}),
        ))
        .expect("plan single delete");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["workflowId"], "wf-9");
    }

    #[test]
    fn mcp_events_carry_per_operation_names() {
        for (operation, expected) in [
            (ResourceOperation::Create, "workspace-mcp-created"),
            (ResourceOperation::Update, "workspace-mcp-updated"),
            (ResourceOperation::Delete, "workspace-mcp-deleted"),
        ] {
            let events = plan(&change(
                ResourceType::Mcp,
                operation,
                json!({"serverId": "mcp-1", "url": "http://localhost:9000"}),
            ))
            .expect("plan mcp");
            assert_eq!(events[0].event, expected);
            assert_eq!(events[0].payload["url"], "http://localhost:9000");
        }
    }

    #[test]
    fn identical_notifications_plan_identically() {
        // Consumers must be idempotent; the broker happily fans out twice.
        let input = change(
            ResourceType::Tools,
            ResourceOperation::Update,
            json!({"toolId": "t1"}),
        );
        let first = plan(&input).expect("first plan");
        let second = plan(&input).expect("second plan");
        assert_eq!(first[0].event, second[0].event);
        assert_eq!(first[0].payload["toolId"], second[0].payload["toolId"]);
    }
}
