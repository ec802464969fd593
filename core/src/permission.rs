use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};

use crate::{db::Database, ids::{UserId, WorkspaceId}};

/// Workspace roles are totally ordered; anything below `Edit` is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceRole {
    Read,
    Edit,
    Admin,
}

impl WorkspaceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceRole::Read => "read",
            WorkspaceRole::Edit => "edit",
            WorkspaceRole::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(WorkspaceRole::Read),
            "edit" => Some(WorkspaceRole::Edit),
            "admin" => Some(WorkspaceRole::Admin),
            _ => None,
        }
    }

    pub fn can_edit(&self) -> bool {
        *self >= WorkspaceRole::Edit
    }
}

impl std::fmt::Display for WorkspaceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct PermissionStore {
    pool: Pool<Sqlite>,
}

impl PermissionStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    /// The single question the broker ever asks: does this user have a role
    /// on this workspace, and which one.
    pub async fn workspace_role(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<WorkspaceRole>> {
        let row = sqlx::query(
            "SELECT role FROM workspace_permissions WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.get("role");
        WorkspaceRole::parse(&raw)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("unknown role '{raw}' in permission store"))
    }

    pub async fn set_role(
        &self,
        user_id: &UserId,
        workspace_id: &WorkspaceId,
        role: WorkspaceRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workspace_permissions (workspace_id, user_id, role)
             VALUES (?, ?, ?)
             ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = excluded.role",
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, user_id: &UserId, workspace_id: &WorkspaceId) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM workspace_permissions WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;

    #[test]
    fn roles_are_totally_ordered() {
        assert!(WorkspaceRole::Read < WorkspaceRole::Edit);
        assert!(WorkspaceRole::Edit < WorkspaceRole::Admin);
        assert!(!WorkspaceRole::Read.can_edit());
        assert!(WorkspaceRole::Edit.can_edit());
        assert!(WorkspaceRole::Admin.can_edit());
    }

    #[test]
    fn role_strings_round_trip() {
        for role in [
            WorkspaceRole::Read,
            WorkspaceRole::Edit,
            WorkspaceRole::Admin,
        ] {
            assert_eq!(WorkspaceRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(WorkspaceRole::parse("owner"), None);
    }

    #[tokio::test]
    async fn grant_query_revoke() {
        let (_dir, database) = temp_database().await;
        let store = PermissionStore::new(&database);
        let user = UserId::from("u1");
        let workspace = WorkspaceId::from("ws-1");

        assert_eq!(
            store
                .workspace_role(&user, &workspace)
                .await
                .expect("query"),
            None
        );

        store
            .set_role(&user, &workspace, WorkspaceRole::Edit)
            .await
            .expect("grant");
        assert_eq!(
            store
                .workspace_role(&user, &workspace)
                .await
                .expect("query"),
            Some(WorkspaceRole::Edit)
        );

        store
            .set_role(&user, &workspace, WorkspaceRole::Read)
            .await
            .expect("downgrade");
        assert_eq!(
            store
                .workspace_role(&user, &workspace)
                .await
                .expect("query"),
            Some(WorkspaceRole::Read)
        );

        assert!(store.remove(&user, &workspace).await.expect("revoke"));
        assert_eq!(
            store
                .workspace_role(&user, &workspace)
                .await
                .expect("query"),
            None
        );
    }
}
