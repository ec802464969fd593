use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Durable identity of a workflow, independent of its graph content.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    pub id: String,
    pub workspace_id: String,
    pub folder_id: Option<String>,
    pub name: String,
    pub is_deployed: bool,
    pub deployed_at: Option<i64>,
    pub last_saved: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    pub name: String,
    pub position: Position,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sub_blocks: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeState {
    pub id: String,
    pub source_block_id: String,
    pub target_block_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubflowKind {
    Loop,
    Parallel,
}

impl SubflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubflowKind::Loop => "loop",
            SubflowKind::Parallel => "parallel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "loop" => Some(SubflowKind::Loop),
            "parallel" => Some(SubflowKind::Parallel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowState {
    pub id: String,
    pub kind: SubflowKind,
    pub config: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableState {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub value: JsonValue,
}

/// The full authoritative graph of a workflow, as shipped to clients in a
/// `workflow-state` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub blocks: HashMap<String, BlockState>,
    pub edges: Vec<EdgeState>,
    pub loops: HashMap<String, JsonValue>,
    pub parallels: HashMap<String, JsonValue>,
    pub variables: HashMap<String, VariableState>,
    pub is_deployed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<i64>,
    pub last_saved: i64,
}

impl WorkflowState {
    pub fn block(&self, id: &str) -> Option<&BlockState> {
        self.blocks.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&EdgeState> {
        self.edges.iter().find(|edge| edge.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn workflow_state_serializes_camel_case() {
        let mut state = WorkflowState::default();
        state.blocks.insert(
            "b1".into(),
            BlockState {
                id: "b1".into(),
                block_type: "agent".into(),
                name: "Agent 1".into(),
                position: Position { x: 10.0, y: 20.0 },
                enabled: true,
                parent_id: None,
                sub_blocks: HashMap::new(),
            },
        );
        state.edges.push(EdgeState {
            id: "e1".into(),
            source_block_id: "b1".into(),
            target_block_id: "b1".into(),
            source_handle: None,
            target_handle: None,
        });
        state.last_saved = 42;

        let value = serde_json::to_value(&state).expect("serialize state");
        assert_eq!(value["blocks"]["b1"]["type"], "agent");
        assert_eq!(value["blocks"]["b1"]["position"]["x"], 10.0);
        assert_eq!(value["edges"][0]["sourceBlockId"], "b1");
        assert_eq!(value["isDeployed"], false);
        assert_eq!(value["lastSaved"], 42);
    }

    #[test]
    fn subflow_kind_round_trips() {
        assert_eq!(SubflowKind::parse("loop"), Some(SubflowKind::Loop));
        assert_eq!(SubflowKind::parse("parallel"), Some(SubflowKind::Parallel));
        assert_eq!(SubflowKind::parse("sequence"), None);
        assert_eq!(
            serde_json::to_value(SubflowKind::Parallel).expect("serialize"),
            json!("parallel")
        );
    }
}
