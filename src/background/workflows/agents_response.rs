use crate::agents::{ResponseOutput, ResponseRequest};
use crate::background::activities::AgentResponder;
use crate::background::engine::{ActivityOptions, ActivityRetryPolicy, WorkflowContext, WorkflowStep};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsResponseInput {
    pub project_id: Uuid,
    /// Workflow id, returned to clients as the response id
    pub response_id: String,
    pub request: ResponseRequest,
}

/// Runs one agent response as a single activity
pub async fn agents_response_workflow(
    ctx: WorkflowContext,
    responder: Arc<dyn AgentResponder>,
    input: AgentsResponseInput,
) -> Result<WorkflowStep<AgentsResponseInput, ResponseOutput>> {
    info!(
        project_id = %input.project_id,
        response_id = %input.response_id,
        "running agent response"
    );
    // Model calls are not idempotent
    let options = ActivityOptions::new(RESPONSE_TIMEOUT, ActivityRetryPolicy::attempts(1));
    let output = ctx
        .execute_activity("agents_response", &options, || {
            responder.run_response(input.project_id, &input.response_id, input.request.clone())
        })
        .await?;
    Ok(WorkflowStep::Complete(output))
}
