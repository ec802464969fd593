// Router configuration

use axum::{
    Router,
    http::Method,
    routing::{get, post},
};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use axum_tracing_opentelemetry::middleware::{OtelAxumLayer, OtelInResponseLayer};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{health_handlers::*, ingress_handlers::*},
    observability,
    state::AppState,
};

pub fn build_router(state: AppState) -> Router {
    let (socket_layer, socket_io) = crate::socket::build_socket_layer(state.clone());
    let _ = state.socket_io.set(socket_io);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let router = Router::new()
        // Health & Info
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/stats", get(stats_handler))
        // Application-tier ingress
        .route("/api/workflow-deleted", post(workflow_deleted_handler))
        .route("/api/workflow-updated", post(workflow_updated_handler))
        .route("/api/workflow-reverted", post(workflow_reverted_handler))
        .route(
            "/api/copilot-workflow-edit",
            post(copilot_workflow_edit_handler),
        )
        .route("/api/permission-changed", post(permission_changed_handler))
        .route(
            "/api/workspace-resource-changed",
            post(workspace_resource_changed_handler),
        );

    let router = router
        .layer(socket_layer)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(observability::http_make_span())
                .on_response(observability::response_logger()),
        )
        .layer(cors)
        .layer(HttpMetricsLayerBuilder::new().build());

    let router = if observability::otel_layers_enabled() {
        router
            .layer(OtelInResponseLayer::default())
            .layer(OtelAxumLayer::default().filter(observability::should_sample_path))
    } else {
        router
    };

    router
        .layer(observability::request_context_layer())
        .with_state(state)
}
