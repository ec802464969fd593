use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use loomcast_core::{
    config::AppConfig,
    db::Database,
    permission::PermissionStore,
    token::TokenStore,
    user::UserStore,
    workflow_store::WorkflowStore,
};

use crate::registry::RoomRegistry;

/// Component-level fixture: real sqlite stores on a scratch database plus an
/// in-memory registry, no socket transport.
pub(crate) struct TestHarness {
    _dir: TempDir,
    pub(crate) registry: Arc<RoomRegistry>,
    pub(crate) workflow_store: WorkflowStore,
    pub(crate) permission_store: PermissionStore,
    pub(crate) token_store: TokenStore,
    pub(crate) user_store: UserStore,
}

impl TestHarness {
    pub(crate) async fn new() -> Self {
        let ttl = Duration::from_secs(30);
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = AppConfig {
            database_path: dir.path().join("test.db").to_string_lossy().into_owned(),
            ..AppConfig::default()
        };
        let database = Database::connect(&config).await.expect("connect database");

        Self {
            registry: Arc::new(RoomRegistry::new(ttl)),
            workflow_store: WorkflowStore::new(&database),
            permission_store: PermissionStore::new(&database),
            token_store: TokenStore::new(&database),
            user_store: UserStore::new(&database),
            _dir: dir,
        }
    }

    pub(crate) async fn create_workflow(&self, workspace_id: &str) -> String {
        self.workflow_store
            .create(workspace_id, Some("Test Workflow"), None)
            .await
            .expect("create workflow")
            .id
    }

    /// AppState over the harness stores, with no socket transport attached:
    /// emits become no-ops while every registry and store effect stays
    /// observable.
    pub(crate) fn app_state(&self) -> crate::state::AppState {
        crate::state::AppState {
            config: AppConfig::default(),
            workflow_store: self.workflow_store.clone(),
            permission_store: self.permission_store.clone(),
            token_verifier: Arc::new(self.token_store.clone()),
            token_store: self.token_store.clone(),
            user_store: self.user_store.clone(),
            registry: self.registry.clone(),
            metadata: crate::state::ServerMetadata::load(),
            socket_io: Arc::new(once_cell::sync::OnceCell::new()),
            socket_metrics: Arc::new(crate::state::SocketMetrics::default()),
        }
    }
}
