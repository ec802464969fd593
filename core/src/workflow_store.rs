use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite, sqlite::SqliteRow};
use uuid::Uuid;

use crate::{
    db::Database,
    ops::{VariableField, WorkflowOperation},
    workflow::{
        BlockState, EdgeState, Position, SubflowKind, SubflowState, VariableState, WorkflowRecord,
        WorkflowState,
    },
};

pub const DEFAULT_WORKFLOW_NAME: &str = "Untitled Workflow";

/// Failure modes of a transactional mutation. `Conflict` is a precondition
/// the client can act on (surfaced as `operation-failed`); everything else is
/// an internal fault.
#[derive(Debug)]
pub enum ApplyError {
    WorkflowNotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::WorkflowNotFound(id) => write!(f, "workflow {id} not found"),
            ApplyError::Conflict(message) => f.write_str(message),
            ApplyError::Internal(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<sqlx::Error> for ApplyError {
    fn from(error: sqlx::Error) -> Self {
        ApplyError::Internal(error.into())
    }
}

impl From<serde_json::Error> for ApplyError {
    fn from(error: serde_json::Error) -> Self {
        ApplyError::Internal(error.into())
    }
}

#[derive(Clone)]
pub struct WorkflowStore {
    pool: Pool<Sqlite>,
}

impl WorkflowStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    pub async fn create(
        &self,
        workspace_id: &str,
        name: Option<&str>,
        folder_id: Option<&str>,
    ) -> Result<WorkflowRecord> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp_millis();
        let resolved_name = name
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| DEFAULT_WORKFLOW_NAME.to_string());

        sqlx::query(
            "INSERT INTO workflows (
                 id, workspace_id, folder_id, name,
                 is_deployed, deployed_at, last_saved, created_at
             ) VALUES (?, ?, ?, ?, 0, NULL, ?, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(folder_id)
        .bind(resolved_name.as_str())
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(WorkflowRecord {
            id,
            workspace_id: workspace_id.to_owned(),
            folder_id: folder_id.map(ToOwned::to_owned),
            name: resolved_name,
            is_deployed: false,
            deployed_at: None,
            last_saved: created_at,
            created_at,
        })
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, folder_id, name,
                    is_deployed, deployed_at, last_saved, created_at
             FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::map_workflow_row))
    }

    pub async fn list_by_folder(&self, folder_id: &str) -> Result<Vec<WorkflowRecord>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, folder_id, name,
                    is_deployed, deployed_at, last_saved, created_at
             FROM workflows WHERE folder_id = ? ORDER BY created_at",
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::map_workflow_row).collect())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Reads the full authoritative graph, the payload of `workflow-state`.
    pub async fn load_state(&self, id: &str) -> Result<Option<WorkflowState>> {
        let Some(record) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        let block_rows = sqlx::query(
            "SELECT id, block_type, name, position_x, position_y,
                    enabled, parent_id, sub_blocks
             FROM workflow_blocks WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut blocks = HashMap::with_capacity(block_rows.len());
        for row in block_rows {
            let block = Self::map_block_row(row)?;
            blocks.insert(block.id.clone(), block);
        }

        let edge_rows = sqlx::query(
            "SELECT id, source_block_id, target_block_id, source_handle, target_handle
             FROM workflow_edges WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let edges = edge_rows
            .into_iter()
            .map(|row| EdgeState {
                id: row.get("id"),
                source_block_id: row.get("source_block_id"),
                target_block_id: row.get("target_block_id"),
                source_handle: row.get("source_handle"),
                target_handle: row.get("target_handle"),
            })
            .collect();

        let subflow_rows = sqlx::query(
            "SELECT id, kind, config FROM workflow_subflows WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut loops = HashMap::new();
        let mut parallels = HashMap::new();
        for row in subflow_rows {
            let subflow = Self::map_subflow_row(row)?;
            match subflow.kind {
                SubflowKind::Loop => loops.insert(subflow.id.clone(), subflow.config),
                SubflowKind::Parallel => parallels.insert(subflow.id.clone(), subflow.config),
            };
        }

        let variable_rows = sqlx::query(
            "SELECT id, name, var_type, value FROM workflow_variables WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut variables = HashMap::with_capacity(variable_rows.len());
        for row in variable_rows {
            let variable = Self::map_variable_row(row)?;
            variables.insert(variable.id.clone(), variable);
        }

        Ok(Some(WorkflowState {
            blocks,
            edges,
            loops,
            parallels,
            variables,
            is_deployed: record.is_deployed,
            deployed_at: record.deployed_at,
            last_saved: record.last_saved,
        }))
    }

    /// Replaces the entire graph in one transaction. Used by the revert and
    /// out-of-band rewrite paths.
    pub async fn replace_state(
        &self,
        id: &str,
        state: &WorkflowState,
        timestamp: i64,
    ) -> Result<(), ApplyError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(ApplyError::WorkflowNotFound(id.to_owned()));
        }

        for table in [
            "workflow_blocks",
            "workflow_edges",
            "workflow_subflows",
            "workflow_variables",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE workflow_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for block in state.blocks.values() {
            sqlx::query(
                "INSERT INTO workflow_blocks (
                     workflow_id, id, block_type, name,
                     position_x, position_y, enabled, parent_id, sub_blocks
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&block.id)
            .bind(&block.block_type)
            .bind(&block.name)
            .bind(block.position.x)
            .bind(block.position.y)
            .bind(block.enabled)
            .bind(block.parent_id.as_ref())
            .bind(serde_json::to_string(&block.sub_blocks)?)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &state.edges {
            sqlx::query(
                "INSERT INTO workflow_edges (
                     workflow_id, id, source_block_id, target_block_id,
                     source_handle, target_handle
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&edge.id)
            .bind(&edge.source_block_id)
            .bind(&edge.target_block_id)
            .bind(edge.source_handle.as_ref())
            .bind(edge.target_handle.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        for (kind, entries) in [
            (SubflowKind::Loop, &state.loops),
            (SubflowKind::Parallel, &state.parallels),
        ] {
            for (subflow_id, config) in entries {
                sqlx::query(
                    "INSERT INTO workflow_subflows (workflow_id, id, kind, config)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(id)
                .bind(subflow_id)
                .bind(kind.as_str())
                .bind(serde_json::to_string(config)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        for variable in state.variables.values() {
            sqlx::query(
                "INSERT INTO workflow_variables (workflow_id, id, name, var_type, value)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(&variable.id)
            .bind(&variable.name)
            .bind(&variable.var_type)
            .bind(serde_json::to_string(&variable.value)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE workflows SET last_saved = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Applies one validated mutation in a single transaction. The
    /// transaction enforces the semantic invariants; any violated
    /// precondition surfaces as `Conflict` and rolls everything back.
    pub async fn apply(
        &self,
        id: &str,
        operation: &WorkflowOperation,
        timestamp: i64,
    ) -> Result<(), ApplyError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(ApplyError::WorkflowNotFound(id.to_owned()));
        }

        match operation {
            WorkflowOperation::AddBlock {
                id: block_id,
                block_type,
                name,
                position,
                parent_id,
                sub_blocks,
            } => {
                let duplicate = sqlx::query(
                    "SELECT 1 FROM workflow_blocks WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(block_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
                if duplicate {
                    return Err(ApplyError::Conflict(format!(
                        "block {block_id} already exists"
                    )));
                }

                sqlx::query(
                    "INSERT INTO workflow_blocks (
                         workflow_id, id, block_type, name,
                         position_x, position_y, enabled, parent_id, sub_blocks
                     ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
                )
                .bind(id)
                .bind(block_id)
                .bind(block_type)
                .bind(name)
                .bind(position.x)
                .bind(position.y)
                .bind(parent_id.as_ref())
                .bind(serde_json::to_string(sub_blocks)?)
                .execute(&mut *tx)
                .await?;
            }
            WorkflowOperation::RemoveBlock { id: block_id } => {
                let removed = sqlx::query(
                    "DELETE FROM workflow_blocks WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
                if removed.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!("block {block_id} not found")));
                }

                // Attached edges and any subflow entry go with the block.
                sqlx::query(
                    "DELETE FROM workflow_edges
                     WHERE workflow_id = ? AND (source_block_id = ? OR target_block_id = ?)",
                )
                .bind(id)
                .bind(block_id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM workflow_subflows WHERE workflow_id = ? AND id = ?")
                    .bind(id)
                    .bind(block_id)
                    .execute(&mut *tx)
                    .await?;
            }
            WorkflowOperation::UpdatePosition {
                id: block_id,
                position,
                commit: _,
            } => {
                let updated = sqlx::query(
                    "UPDATE workflow_blocks SET position_x = ?, position_y = ?
                     WHERE workflow_id = ? AND id = ?",
                )
                .bind(position.x)
                .bind(position.y)
                .bind(id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!("block {block_id} not found")));
                }
            }
            WorkflowOperation::UpdateName { id: block_id, name } => {
                let updated = sqlx::query(
                    "UPDATE workflow_blocks SET name = ? WHERE workflow_id = ? AND id = ?",
                )
                .bind(name)
                .bind(id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!("block {block_id} not found")));
                }
            }
            WorkflowOperation::ToggleEnabled { id: block_id } => {
                let updated = sqlx::query(
                    "UPDATE workflow_blocks SET enabled = 1 - enabled
                     WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!("block {block_id} not found")));
                }
            }
            WorkflowOperation::AddEdge {
                id: edge_id,
                source_block_id,
                target_block_id,
                source_handle,
                target_handle,
            } => {
                let endpoints: i64 = sqlx::query(
                    "SELECT COUNT(*) AS n FROM workflow_blocks
                     WHERE workflow_id = ? AND id IN (?, ?)",
                )
                .bind(id)
                .bind(source_block_id)
                .bind(target_block_id)
                .fetch_one(&mut *tx)
                .await?
                .get("n");

                let expected = if source_block_id == target_block_id { 1 } else { 2 };
                if endpoints < expected {
                    return Err(ApplyError::Conflict(
                        "edge endpoints must both exist as blocks of the workflow".to_string(),
                    ));
                }

                let duplicate = sqlx::query(
                    "SELECT 1 FROM workflow_edges WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(edge_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
                if duplicate {
                    return Err(ApplyError::Conflict(format!(
                        "edge {edge_id} already exists"
                    )));
                }

                sqlx::query(
                    "INSERT INTO workflow_edges (
                         workflow_id, id, source_block_id, target_block_id,
                         source_handle, target_handle
                     ) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(edge_id)
                .bind(source_block_id)
                .bind(target_block_id)
                .bind(source_handle.as_ref())
                .bind(target_handle.as_ref())
                .execute(&mut *tx)
                .await?;
            }
            WorkflowOperation::RemoveEdge { id: edge_id } => {
                let removed =
                    sqlx::query("DELETE FROM workflow_edges WHERE workflow_id = ? AND id = ?")
                        .bind(id)
                        .bind(edge_id)
                        .execute(&mut *tx)
                        .await?;
                if removed.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!("edge {edge_id} not found")));
                }
            }
            WorkflowOperation::UpdateSubflow { id: subflow_id, kind, config } => {
                sqlx::query(
                    "INSERT INTO workflow_subflows (workflow_id, id, kind, config)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT (workflow_id, id) DO UPDATE SET kind = ?, config = ?",
                )
                .bind(id)
                .bind(subflow_id)
                .bind(kind.as_str())
                .bind(serde_json::to_string(config)?)
                .bind(kind.as_str())
                .bind(serde_json::to_string(config)?)
                .execute(&mut *tx)
                .await?;
            }
            WorkflowOperation::AddVariable {
                id: variable_id,
                name,
                var_type,
                value,
            } => {
                let duplicate = sqlx::query(
                    "SELECT 1 FROM workflow_variables WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(variable_id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
                if duplicate {
                    return Err(ApplyError::Conflict(format!(
                        "variable {variable_id} already exists"
                    )));
                }

                sqlx::query(
                    "INSERT INTO workflow_variables (workflow_id, id, name, var_type, value)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(id)
                .bind(variable_id)
                .bind(name)
                .bind(var_type)
                .bind(serde_json::to_string(value)?)
                .execute(&mut *tx)
                .await?;
            }
            WorkflowOperation::UpdateVariable {
                id: variable_id,
                field,
                value,
            } => {
                let statement = match field {
                    VariableField::Name => {
                        "UPDATE workflow_variables SET name = ? WHERE workflow_id = ? AND id = ?"
                    }
                    VariableField::Type => {
                        "UPDATE workflow_variables SET var_type = ? WHERE workflow_id = ? AND id = ?"
                    }
                    VariableField::Value => {
                        "UPDATE workflow_variables SET value = ? WHERE workflow_id = ? AND id = ?"
                    }
                };

                let bound = match field {
                    VariableField::Value => serde_json::to_string(value)?,
                    _ => value
                        .as_str()
                        .map(ToOwned::to_owned)
                        .ok_or_else(|| {
                            ApplyError::Conflict(format!(
                                "variable {} must be a string",
                                field.as_str()
                            ))
                        })?,
                };

                let updated = sqlx::query(statement)
                    .bind(bound)
                    .bind(id)
                    .bind(variable_id)
                    .execute(&mut *tx)
                    .await?;
                if updated.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!(
                        "variable {variable_id} not found"
                    )));
                }
            }
            WorkflowOperation::RemoveVariable { id: variable_id } => {
                let removed = sqlx::query(
                    "DELETE FROM workflow_variables WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(variable_id)
                .execute(&mut *tx)
                .await?;
                if removed.rows_affected() == 0 {
                    return Err(ApplyError::Conflict(format!(
                        "variable {variable_id} not found"
                    )));
                }
            }
            WorkflowOperation::UpdateSubblock {
                block_id,
                subblock_id,
                value,
            } => {
                let row = sqlx::query(
                    "SELECT sub_blocks FROM workflow_blocks WHERE workflow_id = ? AND id = ?",
                )
                .bind(id)
                .bind(block_id)
                .fetch_optional(&mut *tx)
                .await?;

                let Some(row) = row else {
                    return Err(ApplyError::Conflict(format!("block {block_id} not found")));
                };

                let raw: String = row.get("sub_blocks");
                let mut sub_blocks: HashMap<String, serde_json::Value> =
                    serde_json::from_str(&raw)?;
                sub_blocks.insert(subblock_id.clone(), value.clone());

                sqlx::query(
                    "UPDATE workflow_blocks SET sub_blocks = ? WHERE workflow_id = ? AND id = ?",
                )
                .bind(serde_json::to_string(&sub_blocks)?)
                .bind(id)
                .bind(block_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE workflows SET last_saved = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    fn map_workflow_row(row: SqliteRow) -> WorkflowRecord {
        WorkflowRecord {
            id: row.get("id"),
            workspace_id: row.get("workspace_id"),
            folder_id: row.get("folder_id"),
            name: row.get("name"),
            is_deployed: row.get::<i64, _>("is_deployed") != 0,
            deployed_at: row.get("deployed_at"),
            last_saved: row.get("last_saved"),
            created_at: row.get("created_at"),
        }
    }

    fn map_block_row(row: SqliteRow) -> Result<BlockState> {
        let raw: String = row.get("sub_blocks");
        Ok(BlockState {
            id: row.get("id"),
            block_type: row.get("block_type"),
            name: row.get("name"),
            position: Position {
                x: row.get("position_x"),
                y: row.get("position_y"),
            },
            enabled: row.get::<i64, _>("enabled") != 0,
            parent_id: row.get("parent_id"),
            sub_blocks: serde_json::from_str(&raw)?,
        })
    }

    fn map_subflow_row(row: SqliteRow) -> Result<SubflowState> {
        let kind_raw: String = row.get("kind");
        let kind = SubflowKind::parse(&kind_raw)
            .ok_or_else(|| anyhow::anyhow!("unknown subflow kind '{kind_raw}' in store"))?;
        let raw: String = row.get("config");
        Ok(SubflowState {
            id: row.get("id"),
            kind,
            config: serde_json::from_str(&raw)?,
        })
    }

    fn map_variable_row(row: SqliteRow) -> Result<VariableState> {
        let raw: String = row.get("value");
        Ok(VariableState {
            id: row.get("id"),
            name: row.get("name"),
            var_type: row.get("var_type"),
            value: serde_json::from_str(&raw)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use serde_json::json;
    use std::collections::HashMap;

    async fn store_with_workflow() -> (tempfile::TempDir, WorkflowStore, String) {
        let (dir, database) = temp_database().await;
        let store = WorkflowStore::new(&database);
        let record = store
            .create("ws-1", Some("Pipeline"), None)
            .await
            .expect("create workflow");
        (dir, store, record.id)
    }

    fn add_block(id: &str) -> WorkflowOperation {
        WorkflowOperation::AddBlock {
            id: id.to_string(),
            block_type: "agent".to_string(),
            name: format!("Block {id}"),
            position: Position { x: 0.0, y: 0.0 },
            parent_id: None,
            sub_blocks: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn add_and_load_round_trip() {
        let (_dir, store, workflow_id) = store_with_workflow().await;

        store
            .apply(&workflow_id, &add_block("b1"), 100)
            .await
            .expect("add b1");
        store
            .apply(&workflow_id, &add_block("b2"), 101)
            .await
            .expect("add b2");
        store
            .apply(
                &workflow_id,
                &WorkflowOperation::AddEdge {
                    id: "e1".into(),
                    source_block_id: "b1".into(),
                    target_block_id: "b2".into(),
                    source_handle: Some("source".into()),
                    target_handle: None,
                },
                102,
            )
            .await
            .expect("add edge");

        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load state")
            .expect("workflow exists");
        assert_eq!(state.blocks.len(), 2);
        assert_eq!(state.edges.len(), 1);
        assert_eq!(state.last_saved, 102);
        assert_eq!(state.edges[0].source_handle.as_deref(), Some("source"));
    }

    #[tokio::test]
    async fn edge_to_missing_block_conflicts() {
        let (_dir, store, workflow_id) = store_with_workflow().await;
        store
            .apply(&workflow_id, &add_block("b1"), 100)
            .await
            .expect("add b1");

        let err = store
            .apply(
                &workflow_id,
                &WorkflowOperation::AddEdge {
                    id: "e1".into(),
                    source_block_id: "b1".into(),
                    target_block_id: "ghost".into(),
                    source_handle: None,
                    target_handle: None,
                },
                101,
            )
            .await
            .expect_err("edge endpoint missing");
        assert!(matches!(err, ApplyError::Conflict(_)));

        // Nothing from the failed transaction may be visible.
        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load")
            .expect("exists");
        assert!(state.edges.is_empty());
        assert_eq!(state.last_saved, 100);
    }

    #[tokio::test]
    async fn removing_block_drops_attached_edges() {
        let (_dir, store, workflow_id) = store_with_workflow().await;
        store.apply(&workflow_id, &add_block("b1"), 1).await.expect("b1");
        store.apply(&workflow_id, &add_block("b2"), 2).await.expect("b2");
        store
            .apply(
                &workflow_id,
                &WorkflowOperation::AddEdge {
                    id: "e1".into(),
                    source_block_id: "b1".into(),
                    target_block_id: "b2".into(),
                    source_handle: None,
                    target_handle: None,
                },
                3,
            )
            .await
            .expect("edge");

        store
            .apply(
                &workflow_id,
                &WorkflowOperation::RemoveBlock { id: "b1".into() },
                4,
            )
            .await
            .expect("remove block");

        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load")
            .expect("exists");
        assert!(state.blocks.contains_key("b2"));
        assert!(!state.blocks.contains_key("b1"));
        assert!(state.edges.is_empty());
    }

    #[tokio::test]
    async fn subblock_update_merges_into_block() {
        let (_dir, store, workflow_id) = store_with_workflow().await;
        store.apply(&workflow_id, &add_block("b1"), 1).await.expect("b1");

        store
            .apply(
                &workflow_id,
                &WorkflowOperation::UpdateSubblock {
                    block_id: "b1".into(),
                    subblock_id: "prompt".into(),
                    value: json!("write a haiku"),
                },
                2,
            )
            .await
            .expect("subblock update");

        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(
            state.blocks["b1"].sub_blocks.get("prompt"),
            Some(&json!("write a haiku"))
        );
    }

    #[tokio::test]
    async fn subblock_update_on_missing_block_conflicts() {
        let (_dir, store, workflow_id) = store_with_workflow().await;
        let err = store
            .apply(
                &workflow_id,
                &WorkflowOperation::UpdateSubblock {
                    block_id: "ghost".into(),
                    subblock_id: "prompt".into(),
                    value: json!(1),
                },
                2,
            )
            .await
            .expect_err("missing block");
        assert!(matches!(err, ApplyError::Conflict(_)));
    }

    #[tokio::test]
    async fn variable_lifecycle() {
        let (_dir, store, workflow_id) = store_with_workflow().await;

        store
            .apply(
                &workflow_id,
                &WorkflowOperation::AddVariable {
                    id: "v1".into(),
                    name: "count".into(),
                    var_type: "number".into(),
                    value: json!(3),
                },
                1,
            )
            .await
            .expect("add variable");

        store
            .apply(
                &workflow_id,
                &WorkflowOperation::UpdateVariable {
                    id: "v1".into(),
                    field: VariableField::Value,
                    value: json!(7),
                },
                2,
            )
            .await
            .expect("update variable");

        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(state.variables["v1"].value, json!(7));

        store
            .apply(
                &workflow_id,
                &WorkflowOperation::RemoveVariable { id: "v1".into() },
                3,
            )
            .await
            .expect("remove variable");

        let err = store
            .apply(
                &workflow_id,
                &WorkflowOperation::RemoveVariable { id: "v1".into() },
                4,
            )
            .await
            .expect_err("already removed");
        assert!(matches!(err, ApplyError::Conflict(_)));
    }

    #[tokio::test]
    async fn replace_state_overwrites_everything() {
        let (_dir, store, workflow_id) = store_with_workflow().await;
        store.apply(&workflow_id, &add_block("old"), 1).await.expect("old");

        let mut replacement = WorkflowState::default();
        replacement.blocks.insert(
            "new".into(),
            BlockState {
                id: "new".into(),
                block_type: "api".into(),
                name: "New".into(),
                position: Position { x: 5.0, y: 5.0 },
                enabled: true,
                parent_id: None,
                sub_blocks: HashMap::new(),
            },
        );
        replacement
            .loops
            .insert("loop-1".into(), json!({"iterations": 4}));

        store
            .replace_state(&workflow_id, &replacement, 99)
            .await
            .expect("replace");

        let state = store
            .load_state(&workflow_id)
            .await
            .expect("load")
            .expect("exists");
        assert!(!state.blocks.contains_key("old"));
        assert!(state.blocks.contains_key("new"));
        assert_eq!(state.loops["loop-1"], json!({"iterations": 4}));
        assert_eq!(state.last_saved, 99);
    }

    #[tokio::test]
    async fn unknown_workflow_reports_not_found() {
        let (_dir, database) = temp_database().await;
        let store = WorkflowStore::new(&database);
        let err = store
            .apply("missing", &add_block("b1"), 1)
            .await
            .expect_err("workflow missing");
        assert!(matches!(err, ApplyError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn list_by_folder_filters() {
        let (_dir, database) = temp_database().await;
        let store = WorkflowStore::new(&database);
        store
            .create("ws-1", Some("A"), Some("f1"))
            .await
            .expect("a");
        store
            .create("ws-1", Some("B"), Some("f1"))
            .await
            .expect("b");
        store.create("ws-1", Some("C"), None).await.expect("c");

        let in_folder = store.list_by_folder("f1").await.expect("list");
        assert_eq!(in_folder.len(), 2);
    }
}
