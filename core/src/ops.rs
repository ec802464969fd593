use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::workflow::{Position, SubflowKind};

/// Raw mutation request as received from a client. Payload shape is only
/// checked once the `(target, operation)` pair is known.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEnvelope {
    pub operation: String,
    pub target: OperationTarget,
    #[serde(default)]
    pub payload: JsonValue,
    pub operation_id: String,
    #[serde(default)]
    pub client_timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationTarget {
    Block,
    Edge,
    Subflow,
    Variable,
    Subblock,
}

impl OperationTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTarget::Block => "block",
            OperationTarget::Edge => "edge",
            OperationTarget::Subflow => "subflow",
            OperationTarget::Variable => "variable",
            OperationTarget::Subblock => "subblock",
        }
    }
}

/// A structurally valid workflow mutation, ready to be applied to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOperation {
    AddBlock {
        id: String,
        block_type: String,
        name: String,
        position: Position,
        parent_id: Option<String>,
        sub_blocks: HashMap<String, JsonValue>,
    },
    RemoveBlock {
        id: String,
    },
    UpdatePosition {
        id: String,
        position: Position,
        commit: bool,
    },
    UpdateName {
        id: String,
        name: String,
    },
    ToggleEnabled {
        id: String,
    },
    AddEdge {
        id: String,
        source_block_id: String,
        target_block_id: String,
        source_handle: Option<String>,
        target_handle: Option<String>,
    },
    RemoveEdge {
        id: String,
    },
    UpdateSubflow {
        id: String,
        kind: SubflowKind,
        config: JsonValue,
    },
    AddVariable {
        id: String,
        name: String,
        var_type: String,
        value: JsonValue,
    },
    UpdateVariable {
        id: String,
        field: VariableField,
        value: JsonValue,
    },
    RemoveVariable {
        id: String,
    },
    UpdateSubblock {
        block_id: String,
        subblock_id: String,
        value: JsonValue,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableField {
    Name,
    Type,
    Value,
}

impl VariableField {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableField::Name => "name",
            VariableField::Type => "type",
            VariableField::Value => "value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

impl WorkflowOperation {
    /// Validates the envelope against the supported `(target, operation)`
    /// table. Structural failures are reported back to the originator as an
    /// `operation-error`; nothing here touches the durable store.
    pub fn parse(envelope: &OperationEnvelope) -> Result<Self, ValidationError> {
        let payload = &envelope.payload;
        match (envelope.target, envelope.operation.as_str()) {
            (OperationTarget::Block, "add") => Ok(WorkflowOperation::AddBlock {
                id: require_str(payload, "id")?,
                block_type: require_str(payload, "type")?,
                name: require_str(payload, "name")?,
                position: require_position(payload)?,
                parent_id: optional_str(payload, "parentId"),
                sub_blocks: optional_object(payload, "subBlocks"),
            }),
            (OperationTarget::Block, "remove") => Ok(WorkflowOperation::RemoveBlock {
                id: require_str(payload, "id")?,
            }),
            (OperationTarget::Block, "update-position") => {
                Ok(WorkflowOperation::UpdatePosition {
                    id: require_str(payload, "id")?,
                    position: require_position(payload)?,
                    commit: payload
                        .get("commit")
                        .and_then(JsonValue::as_bool)
                        .unwrap_or(true),
                })
            }
            (OperationTarget::Block, "update-name") => Ok(WorkflowOperation::UpdateName {
                id: require_str(payload, "id")?,
                name: require_str(payload, "name")?,
            }),
            (OperationTarget::Block, "toggle-enabled") => Ok(WorkflowOperation::ToggleEnabled {
                id: require_str(payload, "id")?,
            }),
            (OperationTarget::Edge, "add") => Ok(WorkflowOperation::AddEdge {
                id: require_str(payload, "id")?,
                source_block_id: require_str(payload, "sourceBlockId")?,
                target_block_id: require_str(payload, "targetBlockId")?,
                source_handle: optional_str(payload, "sourceHandle"),
                target_handle: optional_str(payload, "targetHandle"),
            }),
            (OperationTarget::Edge, "remove") => Ok(WorkflowOperation::RemoveEdge {
                id: require_str(payload, "id")?,
            }),
            (OperationTarget::Subflow, "update") => {
                let kind_raw = require_str(payload, "type")?;
                let kind = SubflowKind::parse(&kind_raw).ok_or_else(|| {
                    ValidationError::new(format!("unknown subflow type '{kind_raw}'"))
                })?;
                Ok(WorkflowOperation::UpdateSubflow {
                    id: require_str(payload, "id")?,
                    kind,
                    config: payload.get("config").cloned().unwrap_or(JsonValue::Null),
                })
            }
            (OperationTarget::Variable, "add") => Ok(WorkflowOperation::AddVariable {
                id: require_str(payload, "id")?,
                name: require_str(payload, "name")?,
                var_type: require_str(payload, "type")?,
                value: payload.get("value").cloned().unwrap_or(JsonValue::Null),
            }),
            (OperationTarget::Variable, "update") => {
                let field_raw = require_str(payload, "field")?;
                let field = match field_raw.as_str() {
                    "name" => VariableField::Name,
                    "type" => VariableField::Type,
                    "value" => VariableField::Value,
                    other => {
                        return Err(ValidationError::new(format!(
                            "unknown variable field '{other}'"
                        )));
                    }
                };
                Ok(WorkflowOperation::UpdateVariable {
                    id: require_str(payload, "id")?,
                    field,
                    value: payload.get("value").cloned().unwrap_or(JsonValue::Null),
                })
            }
            (OperationTarget::Variable, "remove") => Ok(WorkflowOperation::RemoveVariable {
                id: require_str(payload, "id")?,
            }),
            (OperationTarget::Subblock, "update") => Ok(WorkflowOperation::UpdateSubblock {
                block_id: require_str(payload, "blockId")?,
                subblock_id: require_str(payload, "subblockId")?,
                value: payload.get("value").cloned().unwrap_or(JsonValue::Null),
            }),
            (target, operation) => Err(ValidationError::new(format!(
                "unsupported operation '{operation}' for target '{}'",
                target.as_str()
            ))),
        }
    }

    /// Intermediate drag positions are broadcast but never written; the final
    /// `commit=true` update is the one that lands in the store.
    pub fn requires_persistence(&self) -> bool {
        !matches!(
            self,
            WorkflowOperation::UpdatePosition { commit: false, .. }
        )
    }
}

fn require_str(payload: &JsonValue, field: &str) -> Result<String, ValidationError> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| ValidationError::new(format!("missing or empty field '{field}'")))
}

fn optional_str(payload: &JsonValue, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn optional_object(payload: &JsonValue, field: &str) -> HashMap<String, JsonValue> {
    payload
        .get(field)
        .and_then(JsonValue::as_object)
        .map(|map| {
            map.iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn require_position(payload: &JsonValue) -> Result<Position, ValidationError> {
    let source = payload.get("position").unwrap_or(payload);
    let x = source
        .get("x")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| ValidationError::new("position requires a numeric 'x'"))?;
    let y = source
        .get("y")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| ValidationError::new("position requires a numeric 'y'"))?;

    if !x.is_finite() || !y.is_finite() {
        return Err(ValidationError::new("position must be finite"));
    }

    Ok(Position { x, y })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(target: OperationTarget, operation: &str, payload: JsonValue) -> OperationEnvelope {
        OperationEnvelope {
            operation: operation.to_string(),
            target,
            payload,
            operation_id: "op-1".to_string(),
            client_timestamp: None,
        }
    }

    #[test]
    fn add_block_parses() {
        let parsed = WorkflowOperation::parse(&envelope(
            OperationTarget::Block,
            "add",
            json!({
                "id": "b1",
                "type": "agent",
                "name": "Agent",
                "position": {"x": 1.5, "y": -3.0},
                "subBlocks": {"prompt": "hello"}
            }),
        ))
        .expect("parse add block");

        match parsed {
            WorkflowOperation::AddBlock {
                id,
                position,
                sub_blocks,
                ..
            } => {
                assert_eq!(id, "b1");
                assert_eq!(position.x, 1.5);
                assert_eq!(sub_blocks.get("prompt"), Some(&json!("hello")));
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn edge_requires_both_endpoints() {
        let err = WorkflowOperation::parse(&envelope(
            OperationTarget::Edge,
            "add",
            json!({"id": "e1", "sourceBlockId": "b1"}),
        ))
        .expect_err("missing targetBlockId");
        assert!(err.message().contains("targetBlockId"));
    }

    #[test]
    fn position_update_requires_numeric_coordinates() {
        let err = WorkflowOperation::parse(&envelope(
            OperationTarget::Block,
            "update-position",
            json!({"id": "b1", "position": {"x": "left", "y": 3}}),
        ))
        .expect_err("non-numeric x");
        assert!(err.message().contains("'x'"));
    }

    #[test]
    fn position_commit_defaults_to_true() {
        let parsed = WorkflowOperation::parse(&envelope(
            OperationTarget::Block,
            "update-position",
            json!({"id": "b1", "x": 4.0, "y": 5.0}),
        ))
        .expect("parse position");
        assert!(matches!(
            parsed,
            WorkflowOperation::UpdatePosition { commit: true, .. }
        ));
        assert!(parsed.requires_persistence());
    }

    #[test]
    fn uncommitted_position_skips_persistence() {
        let parsed = WorkflowOperation::parse(&envelope(
            OperationTarget::Block,
            "update-position",
            json!({"id": "b1", "x": 4.0, "y": 5.0, "commit": false}),
        ))
        .expect("parse position");
        assert!(!parsed.requires_persistence());
    }

    #[test]
    fn unknown_pair_is_rejected() {
        let err = WorkflowOperation::parse(&envelope(
            OperationTarget::Edge,
            "update-name",
            json!({"id": "e1"}),
        ))
        .expect_err("edges have no update-name");
        assert!(err.message().contains("unsupported operation"));
    }

    #[test]
    fn variable_update_validates_field() {
        let err = WorkflowOperation::parse(&envelope(
            OperationTarget::Variable,
            "update",
            json!({"id": "v1", "field": "color", "value": 1}),
        ))
        .expect_err("unknown field");
        assert!(err.message().contains("color"));
    }

    #[test]
    fn non_finite_position_rejected() {
        // serde_json maps non-finite floats to null, so the numeric check fires.
        let err = WorkflowOperation::parse(&envelope(
            OperationTarget::Block,
            "update-position",
            json!({"id": "b1", "x": f64::INFINITY, "y": 0.0}),
        ))
        .expect_err("infinite x");
        assert!(err.message().contains("'x'"));
    }
}
