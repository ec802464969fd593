// Health check and info endpoints

use axum::{Json, extract::State, response::IntoResponse};

use crate::{
    state::AppState,
    types::{HealthResponse, StatsResponse},
};

pub(crate) async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metadata.clone())
}

pub(crate) async fn index_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metadata.clone())
}

pub(crate) async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatsResponse {
        connections: state.socket_metrics.connections(),
        workflow_rooms: state.registry.workflow_room_count(),
        workspace_rooms: state.registry.workspace_room_count(),
        operations: state.socket_metrics.operations(),
        fanout_events: state.socket_metrics.fanout_events(),
    })
}
