//! Scheduled billing, pricing and usage workflows

use crate::background::activities::UsageActivities;
use crate::background::engine::{
    ActivityOptions, ActivityRetryPolicy, IdReusePolicy, StartWorkflowOptions, WorkflowContext, WorkflowEngine,
    WorkflowRun, WorkflowStep,
};
use crate::background::ids;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const BILLING_BATCH_SIZE: usize = 25;
pub const REFRESH_BATCH_PAUSE: Duration = Duration::from_secs(10);
pub const FALLBACK_TRACKING_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingUsageSummary {
    pub organizations: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackModelUsageParams {
    pub generation_id: String,
    pub organization_id: String,
}

fn default_options() -> ActivityOptions {
    ActivityOptions::new(Duration::from_secs(5 * 60), ActivityRetryPolicy::attempts(3))
}

async fn list_organizations(ctx: &WorkflowContext, activities: &Arc<dyn UsageActivities>) -> Result<Vec<String>> {
    ctx.execute_activity("list_organizations", &default_options(), || activities.list_organizations())
        .await
}

/// Refresh cached billing usage in batches, pausing between batches
pub async fn refresh_billing_usage_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn UsageActivities>,
    _input: serde_json::Value,
) -> Result<WorkflowStep<serde_json::Value, BillingUsageSummary>> {
    let organizations = list_organizations(&ctx, &activities).await?;
    let mut batches = 0;
    for batch in organizations.chunks(BILLING_BATCH_SIZE) {
        if batches > 0 {
            ctx.sleep(REFRESH_BATCH_PAUSE).await?;
        }
        ctx.execute_activity("refresh_billing_usage", &default_options(), || {
            activities.refresh_billing_usage(batch)
        })
        .await?;
        batches += 1;
    }
    info!(organizations = organizations.len(), batches, "billing usage refreshed");
    Ok(WorkflowStep::Complete(BillingUsageSummary {
        organizations: organizations.len(),
        batches,
    }))
}

pub async fn report_billing_usage_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn UsageActivities>,
    _input: serde_json::Value,
) -> Result<WorkflowStep<serde_json::Value, BillingUsageSummary>> {
    let organizations = list_organizations(&ctx, &activities).await?;
    let mut batches = 0;
    for batch in organizations.chunks(BILLING_BATCH_SIZE) {
        ctx.execute_activity("report_billing_usage", &default_options(), || {
            activities.report_billing_usage(batch)
        })
        .await?;
        batches += 1;
    }
    info!(organizations = organizations.len(), batches, "billing usage reported");
    Ok(WorkflowStep::Complete(BillingUsageSummary {
        organizations: organizations.len(),
        batches,
    }))
}

pub async fn refresh_model_pricing_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn UsageActivities>,
    _input: serde_json::Value,
) -> Result<WorkflowStep<serde_json::Value, ()>> {
    let options = ActivityOptions::new(Duration::from_secs(5 * 60), ActivityRetryPolicy::attempts(2));
    ctx.execute_activity("refresh_model_pricing", &options, || activities.refresh_model_pricing())
        .await?;
    Ok(WorkflowStep::Complete(()))
}

pub async fn collect_platform_usage_metrics_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn UsageActivities>,
    _input: serde_json::Value,
) -> Result<WorkflowStep<serde_json::Value, ()>> {
    ctx.execute_activity("collect_platform_usage_metrics", &default_options(), || {
        activities.collect_platform_usage_metrics()
    })
    .await?;
    Ok(WorkflowStep::Complete(()))
}

fn fallback_retry() -> ActivityRetryPolicy {
    ActivityRetryPolicy {
        initial_interval: Duration::from_secs(60),
        backoff_coefficient: 1.0,
        max_interval: Duration::from_secs(60),
        max_attempts: 5,
    }
}

/// Record usage for a generation that was not reported inline
pub async fn fallback_model_usage_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn UsageActivities>,
    params: FallbackModelUsageParams,
) -> Result<WorkflowStep<FallbackModelUsageParams, ()>> {
    let options = ActivityOptions::new(Duration::from_secs(60), fallback_retry());
    ctx.execute_activity("track_fallback_model_usage", &options, || {
        activities.track_fallback_model_usage(&params.generation_id, &params.organization_id)
    })
    .await?;
    Ok(WorkflowStep::Complete(()))
}

/// Start fallback tracking one minute from now
pub async fn track_fallback_model_usage(
    engine: &dyn WorkflowEngine,
    task_queue: &str,
    params: FallbackModelUsageParams,
) -> Result<WorkflowRun> {
    let options = StartWorkflowOptions::new(ids::fallback_model_usage_id(&params.generation_id), task_queue)
        .reuse_policy(IdReusePolicy::AllowDuplicateFailedOnly)
        .start_delay(FALLBACK_TRACKING_DELAY);
    engine
        .execute_workflow(ids::FALLBACK_MODEL_USAGE_TRACKING, options, serde_json::to_value(&params)?)
        .await
}
