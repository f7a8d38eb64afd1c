//! Activity boundaries used by the workflows
//!
//! Each trait groups the side-effecting steps of one workflow family. The
//! worker wires concrete implementations in; tests provide scripted ones.

use crate::agents::{ResponseOutput, ResponseRequest};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Created,
    Pending,
    Completed,
    Failed,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeploymentStatus::Created => "created",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a deployment state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionResult {
    /// False when the deployment was not in the expected prior state
    pub moved: bool,
    pub status: DeploymentStatus,
}

#[async_trait]
pub trait DeploymentActivities: Send + Sync {
    async fn transition_deployment(
        &self,
        project_id: Uuid,
        deployment_id: Uuid,
        status: DeploymentStatus,
    ) -> Result<TransitionResult>;

    async fn validate_deployment(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()>;

    async fn process_deployment(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()>;

    async fn provision_functions_access(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()>;

    async fn deploy_function_runners(&self, project_id: Uuid, deployment_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait CustomDomainActivities: Send + Sync {
    /// Empty organization id lists domains across all organizations
    async fn list_active_custom_domains(&self, organization_id: &str) -> Result<Vec<String>>;

    async fn ensure_custom_domain_ingress(&self, domain: &str) -> Result<()>;
}

/// Feedback a user left on a chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFeedback {
    pub message_id: Uuid,
    pub message_index: usize,
    pub resolution: String,
}

/// Inclusive range of message indexes forming one conversation segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSegment {
    pub start_index: usize,
    pub end_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeSegmentArgs {
    pub chat_id: Uuid,
    pub project_id: Uuid,
    pub organization_id: String,
    pub segment: ChatSegment,
    #[serde(default)]
    pub user_feedback: Vec<UserFeedback>,
}

#[async_trait]
pub trait ChatResolutionActivities: Send + Sync {
    async fn fetch_user_feedback(&self, chat_id: Uuid, project_id: Uuid) -> Result<Vec<UserFeedback>>;

    async fn segment_chat(
        &self,
        chat_id: Uuid,
        project_id: Uuid,
        organization_id: &str,
        feedback: &[UserFeedback],
    ) -> Result<Vec<ChatSegment>>;

    async fn delete_chat_resolutions(&self, chat_id: Uuid, project_id: Uuid) -> Result<()>;

    async fn analyze_segment(&self, args: &AnalyzeSegmentArgs) -> Result<()>;
}

#[async_trait]
pub trait UsageActivities: Send + Sync {
    async fn list_organizations(&self) -> Result<Vec<String>>;

    async fn refresh_billing_usage(&self, organization_ids: &[String]) -> Result<()>;

    async fn report_billing_usage(&self, organization_ids: &[String]) -> Result<()>;

    async fn refresh_model_pricing(&self) -> Result<()>;

    async fn collect_platform_usage_metrics(&self) -> Result<()>;

    async fn track_fallback_model_usage(&self, generation_id: &str, organization_id: &str) -> Result<()>;
}

/// Runs one agent response to completion
#[async_trait]
pub trait AgentResponder: Send + Sync {
    async fn run_response(
        &self,
        project_id: Uuid,
        response_id: &str,
        request: ResponseRequest,
    ) -> Result<ResponseOutput>;
}

/// Every activity implementation the worker registers workflows against
#[derive(Clone)]
pub struct Activities {
    pub deployments: Arc<dyn DeploymentActivities>,
    pub custom_domains: Arc<dyn CustomDomainActivities>,
    pub chat_resolutions: Arc<dyn ChatResolutionActivities>,
    pub usage: Arc<dyn UsageActivities>,
    pub agents: Option<Arc<dyn AgentResponder>>,
}

impl Activities {
    /// All families backed by [`NoopActivities`]
    pub fn noop() -> Self {
        let noop = Arc::new(NoopActivities);
        Self {
            deployments: noop.clone(),
            custom_domains: noop.clone(),
            chat_resolutions: noop.clone(),
            usage: noop,
            agents: None,
        }
    }

    pub fn with_agents(mut self, agents: Arc<dyn AgentResponder>) -> Self {
        self.agents = Some(agents);
        self
    }
}

/// Activities for a worker with no backing stores: every step succeeds
/// without side effects and every listing is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivities;

#[async_trait]
impl DeploymentActivities for NoopActivities {
    async fn transition_deployment(
        &self,
        _project_id: Uuid,
        deployment_id: Uuid,
        status: DeploymentStatus,
    ) -> Result<TransitionResult> {
        debug!(deployment_id = %deployment_id, status = %status, "noop deployment transition");
        Ok(TransitionResult { moved: true, status })
    }

    async fn validate_deployment(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn process_deployment(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn provision_functions_access(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn deploy_function_runners(&self, _project_id: Uuid, _deployment_id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CustomDomainActivities for NoopActivities {
    async fn list_active_custom_domains(&self, _organization_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn ensure_custom_domain_ingress(&self, _domain: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChatResolutionActivities for NoopActivities {
    async fn fetch_user_feedback(&self, _chat_id: Uuid, _project_id: Uuid) -> Result<Vec<UserFeedback>> {
        Ok(Vec::new())
    }

    async fn segment_chat(
        &self,
        _chat_id: Uuid,
        _project_id: Uuid,
        _organization_id: &str,
        _feedback: &[UserFeedback],
    ) -> Result<Vec<ChatSegment>> {
        Ok(Vec::new())
    }

    async fn delete_chat_resolutions(&self, _chat_id: Uuid, _project_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn analyze_segment(&self, _args: &AnalyzeSegmentArgs) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UsageActivities for NoopActivities {
    async fn list_organizations(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn refresh_billing_usage(&self, _organization_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn report_billing_usage(&self, _organization_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn refresh_model_pricing(&self) -> Result<()> {
        Ok(())
    }

    async fn collect_platform_usage_metrics(&self) -> Result<()> {
        Ok(())
    }

    async fn track_fallback_model_usage(&self, _generation_id: &str, _organization_id: &str) -> Result<()> {
        Ok(())
    }
}
