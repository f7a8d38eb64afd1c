//! Deployment processing state machine

use crate::background::activities::{DeploymentActivities, DeploymentStatus, TransitionResult};
use crate::background::engine::{
    ActivityOptions, ActivityRetryPolicy, IdReusePolicy, StartWorkflowOptions, WorkflowContext, WorkflowEngine,
    WorkflowRun, WorkflowStep,
};
use crate::background::ids;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
const ACTIVITY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDeploymentParams {
    pub project_id: Uuid,
    pub deployment_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDeploymentResult {
    pub deployment_id: Uuid,
    pub status: DeploymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn step_options() -> ActivityOptions {
    ActivityOptions::new(ACTIVITY_TIMEOUT, ActivityRetryPolicy::attempts(ACTIVITY_ATTEMPTS))
}

fn validate_options() -> ActivityOptions {
    ActivityOptions::new(ACTIVITY_TIMEOUT, ActivityRetryPolicy::attempts(1))
}

async fn transition(
    ctx: &WorkflowContext,
    activities: &Arc<dyn DeploymentActivities>,
    params: &ProcessDeploymentParams,
    status: DeploymentStatus,
) -> Result<DeploymentStatus> {
    let TransitionResult { moved, status: current } = ctx
        .execute_activity("transition_deployment", &step_options(), || {
            activities.transition_deployment(params.project_id, params.deployment_id, status)
        })
        .await?;

    if !moved {
        return Err(GatewayError::non_retryable(format!(
            "deployment {} could not move to {}: current status is {}",
            params.deployment_id, status, current
        )));
    }
    Ok(current)
}

async fn run_steps(
    ctx: &WorkflowContext,
    activities: &Arc<dyn DeploymentActivities>,
    params: &ProcessDeploymentParams,
) -> Result<()> {
    let (project_id, deployment_id) = (params.project_id, params.deployment_id);

    ctx.execute_activity("validate_deployment", &validate_options(), || {
        activities.validate_deployment(project_id, deployment_id)
    })
    .await?;
    ctx.execute_activity("process_deployment", &step_options(), || {
        activities.process_deployment(project_id, deployment_id)
    })
    .await?;
    ctx.execute_activity("provision_functions_access", &step_options(), || {
        activities.provision_functions_access(project_id, deployment_id)
    })
    .await?;
    ctx.execute_activity("deploy_function_runners", &step_options(), || {
        activities.deploy_function_runners(project_id, deployment_id)
    })
    .await?;
    Ok(())
}

/// Pending, then validate, process, provision and deploy; ends completed or failed
pub async fn process_deployment_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn DeploymentActivities>,
    params: ProcessDeploymentParams,
) -> Result<WorkflowStep<ProcessDeploymentParams, ProcessDeploymentResult>> {
    transition(&ctx, &activities, &params, DeploymentStatus::Pending).await?;

    match run_steps(&ctx, &activities, &params).await {
        Ok(()) => {
            let status = transition(&ctx, &activities, &params, DeploymentStatus::Completed).await?;
            info!(
                project_id = %params.project_id,
                deployment_id = %params.deployment_id,
                "deployment completed"
            );
            Ok(WorkflowStep::Complete(ProcessDeploymentResult {
                deployment_id: params.deployment_id,
                status,
                error: None,
            }))
        }
        Err(e) => {
            error!(
                project_id = %params.project_id,
                deployment_id = %params.deployment_id,
                error = %e,
                "deployment processing failed"
            );
            let status = transition(&ctx, &activities, &params, DeploymentStatus::Failed).await?;
            Ok(WorkflowStep::Complete(ProcessDeploymentResult {
                deployment_id: params.deployment_id,
                status,
                error: Some(e.to_string()),
            }))
        }
    }
}

pub async fn start_process_deployment(
    engine: &dyn WorkflowEngine,
    task_queue: &str,
    params: ProcessDeploymentParams,
) -> Result<WorkflowRun> {
    let options = StartWorkflowOptions::new(ids::process_deployment_id(params.deployment_id), task_queue)
        .reuse_policy(IdReusePolicy::AllowDuplicateFailedOnly);
    engine
        .execute_workflow(ids::PROCESS_DEPLOYMENT, options, serde_json::to_value(&params)?)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::LocalWorkflowEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
        refuse_pending: bool,
        process_failures: AtomicU32,
        fail_validation: bool,
    }

    #[async_trait]
    impl DeploymentActivities for Scripted {
        async fn transition_deployment(
            &self,
            _project_id: Uuid,
            _deployment_id: Uuid,
            status: DeploymentStatus,
        ) -> Result<TransitionResult> {
            self.calls.lock().await.push(format!("transition:{}", status));
            if self.refuse_pending && status == DeploymentStatus::Pending {
                return Ok(TransitionResult {
                    moved: false,
                    status: DeploymentStatus::Completed,
                });
            }
            Ok(TransitionResult { moved: true, status })
        }

        async fn validate_deployment(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
            self.calls.lock().await.push("validate".into());
            if self.fail_validation {
                return Err(GatewayError::gateway("openapi document is invalid"));
            }
            Ok(())
        }

        async fn process_deployment(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
            self.calls.lock().await.push("process".into());
            if self.process_failures.load(Ordering::SeqCst) > 0 {
                self.process_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(GatewayError::gateway("asset storage unavailable"));
            }
            Ok(())
        }

        async fn provision_functions_access(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
            self.calls.lock().await.push("provision".into());
            Ok(())
        }

        async fn deploy_function_runners(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
            self.calls.lock().await.push("deploy".into());
            Ok(())
        }
    }

    async fn run(activities: Arc<Scripted>) -> (Result<serde_json::Value>, Vec<String>) {
        let engine = LocalWorkflowEngine::new();
        let acts: Arc<dyn DeploymentActivities> = activities.clone();
        engine.register_workflow(ids::PROCESS_DEPLOYMENT, move |ctx, params| {
            process_deployment_workflow(ctx, acts.clone(), params)
        });
        let params = ProcessDeploymentParams {
            project_id: Uuid::new_v4(),
            deployment_id: Uuid::new_v4(),
        };
        let run = start_process_deployment(&engine, "main", params).await.unwrap();
        let result = engine.wait_result(&run.workflow_id).await;
        let calls = activities.calls.lock().await.clone();
        (result, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_runs_every_step_in_order() {
        let (result, calls) = run(Arc::new(Scripted::default())).await;
        let result: ProcessDeploymentResult = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(result.status, DeploymentStatus::Completed);
        assert_eq!(
            calls,
            vec![
                "transition:pending",
                "validate",
                "process",
                "provision",
                "deploy",
                "transition:completed"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recoverable_step_is_retried() {
        let scripted = Scripted {
            process_failures: AtomicU32::new(2),
            ..Default::default()
        };
        let (result, calls) = run(Arc::new(scripted)).await;
        let result: ProcessDeploymentResult = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(result.status, DeploymentStatus::Completed);
        assert_eq!(calls.iter().filter(|c| *c == "process").count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_is_single_attempt_and_marks_failed() {
        let scripted = Scripted {
            fail_validation: true,
            ..Default::default()
        };
        let (result, calls) = run(Arc::new(scripted)).await;
        let result: ProcessDeploymentResult = serde_json::from_value(result.unwrap()).unwrap();
        assert_eq!(result.status, DeploymentStatus::Failed);
        assert!(result.error.unwrap().contains("openapi document is invalid"));
        assert_eq!(calls, vec!["transition:pending", "validate", "transition:failed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmoved_transition_fails_workflow() {
        let scripted = Scripted {
            refuse_pending: true,
            ..Default::default()
        };
        let (result, calls) = run(Arc::new(scripted)).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("current status is completed"));
        assert_eq!(calls, vec!["transition:pending"]);
    }
}
