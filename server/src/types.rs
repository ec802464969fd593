// Request and response types for the HTTP ingress surface

use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

#[derive(Serialize)]
pub(crate) struct SuccessResponse {
    pub(crate) success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatsResponse {
    pub(crate) connections: usize,
    pub(crate) workflow_rooms: usize,
    pub(crate) workspace_rooms: usize,
    pub(crate) operations: usize,
    pub(crate) fanout_events: usize,
}

/// Body of `/api/workflow-deleted`, `/api/workflow-updated` and
/// `/api/workflow-reverted`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WorkflowNotice {
    pub(crate) workflow_id: String,
}

/// Body of `/api/copilot-workflow-edit`: the durable record was rewritten
/// out of band; clients pull fresh state on receipt.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CopilotEditNotice {
    pub(crate) workflow_id: String,
    #[serde(default)]
    pub(crate) description: Option<String>,
}
