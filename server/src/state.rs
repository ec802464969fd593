use std::env;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value as JsonValue;
use socketioxide::SocketIo;
use tokio::{spawn, time::sleep};
use tracing::warn;

use loomcast_core::{
    config::AppConfig,
    db::Database,
    permission::PermissionStore,
    token::{TokenStore, TokenVerifier},
    user::UserStore,
    workflow_store::WorkflowStore,
};

use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub workflow_store: WorkflowStore,
    pub permission_store: PermissionStore,
    pub token_store: TokenStore,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub user_store: UserStore,
    pub registry: Arc<RoomRegistry>,
    pub metadata: ServerMetadata,
    pub socket_io: Arc<OnceCell<Arc<SocketIo>>>,
    pub socket_metrics: Arc<SocketMetrics>,
}

impl AppState {
    /// Fire-and-forget emit to a room through the io handle. Used by the
    /// ingress paths, which run outside any socket context; socket handlers
    /// emit through their own `SocketRef` instead.
    pub fn emit_to_room(&self, room: String, event: &'static str, payload: JsonValue) {
        let Some(io) = self.socket_io.get() else {
            return;
        };
        let io = io.clone();
        spawn(async move {
            if let Some(ns) = io.of("/") {
                if let Err(err) = ns.to(room).emit(event, &payload).await {
                    warn!(?err, event, "failed to emit room broadcast");
                }
            }
        });
    }

    /// Awaited variant for paths where delivery must happen before further
    /// teardown, e.g. a deletion notice that precedes room removal.
    pub async fn emit_to_room_now(&self, room: String, event: &'static str, payload: JsonValue) {
        let Some(io) = self.socket_io.get() else {
            return;
        };
        if let Some(ns) = io.of("/") {
            if let Err(err) = ns.to(room).emit(event, &payload).await {
                warn!(?err, event, "failed to emit room broadcast");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerMetadata {
    pub compatibility: String,
    pub message: String,
    #[serde(rename = "type")]
    pub deployment_type: String,
    pub flavor: String,
}

impl ServerMetadata {
    pub fn load() -> Self {
        let compatibility = env::var("LOOMCAST_COMPATIBILITY")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let deployment_type = env::var("LOOMCAST_DEPLOYMENT_TYPE")
            .unwrap_or_else(|_| "selfhosted".to_string());

        let flavor =
            env::var("LOOMCAST_FLAVOR").unwrap_or_else(|_| "broker".to_string());

        let message = env::var("LOOMCAST_SERVER_MESSAGE")
            .unwrap_or_else(|_| format!("Loomcast {compatibility} Broker"));

        Self {
            compatibility,
            message,
            deployment_type,
            flavor,
        }
    }
}

#[derive(Default)]
pub struct SocketMetrics {
    connections: AtomicUsize,
    operations: AtomicUsize,
    fanout_events: AtomicUsize,
}

impl SocketMetrics {
    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_operations(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout_events(&self) {
        self.fanout_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn fanout_events(&self) -> usize {
        self.fanout_events.load(Ordering::Relaxed)
    }
}

pub fn build_state(database: &Database, config: &AppConfig) -> AppState {
    let workflow_store = WorkflowStore::new(database);
    let permission_store = PermissionStore::new(database);
    let token_store = TokenStore::new(database);
    let user_store = UserStore::new(database);
    let registry = Arc::new(RoomRegistry::new(Duration::from_secs(
        config.tombstone_ttl_secs,
    )));
    let socket_io = Arc::new(OnceCell::new());
    let socket_metrics = Arc::new(SocketMetrics::default());

    let state = AppState {
        config: config.clone(),
        workflow_store,
        permission_store,
        token_verifier: Arc::new(token_store.clone()),
        token_store,
        user_store,
        registry,
        metadata: ServerMetadata::load(),
        socket_io,
        socket_metrics,
    };

    spawn_background_tasks(&state);

    state
}

const TOMBSTONE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const TOKEN_PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn spawn_background_tasks(state: &AppState) {
    let registry = state.registry.clone();
    spawn(async move {
        loop {
            sleep(TOMBSTONE_SWEEP_INTERVAL).await;
            registry.sweep_tombstones();
        }
    });

    let token_store = state.token_store.clone();
    spawn(async move {
        loop {
            sleep(TOKEN_PURGE_INTERVAL).await;
            if let Err(err) = token_store.purge_expired().await {
                warn!(error = %err, "token purge loop encountered an error");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_metadata_serializes_with_expected_fields() {
        let metadata = ServerMetadata {
            compatibility: "0.3.1".into(),
            message: "Loomcast 0.3.1 Broker".into(),
            deployment_type: "selfhosted".into(),
            flavor: "broker".into(),
        };

        let json = serde_json::to_value(&metadata).expect("metadata serializes");
        assert_eq!(json["compatibility"], "0.3.1");
        assert_eq!(json["type"], "selfhosted");
        assert_eq!(json["flavor"], "broker");
    }

    #[test]
    fn metrics_count_up_and_down() {
        let metrics = SocketMetrics::default();
        metrics.inc_connections();
        metrics.inc_connections();
        metrics.dec_connections();
        metrics.inc_operations();
        metrics.inc_fanout_events();

        assert_eq!(metrics.connections(), 1);
        assert_eq!(metrics.operations(), 1);
        assert_eq!(metrics.fanout_events(), 1);
    }
}
