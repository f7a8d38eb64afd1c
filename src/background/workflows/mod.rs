//! Workflow definitions and their registration

mod agents_response;
mod chat_resolution;
mod custom_domain_reconcile;
mod process_deployment;
mod usage;

pub use agents_response::{agents_response_workflow, AgentsResponseInput};
pub use chat_resolution::{
    analyze_chat_resolutions_workflow, delayed_chat_resolution_workflow, schedule_chat_resolution_analysis,
    ChatResolutionParams, ChatResolutionSummary, INACTIVITY_TIMEOUT, MAX_WAIT, RESET_TIMER_SIGNAL,
};
pub use custom_domain_reconcile::{
    custom_domain_reconcile_workflow, reconcile_schedule, trigger_custom_domain_reconcile,
    CustomDomainReconcileParams, CustomDomainReconcileResult, ReconcileContinuationState, ReconcileSettings,
};
pub use process_deployment::{
    process_deployment_workflow, start_process_deployment, ProcessDeploymentParams, ProcessDeploymentResult,
};
pub use usage::{
    collect_platform_usage_metrics_workflow, fallback_model_usage_workflow, refresh_billing_usage_workflow,
    refresh_model_pricing_workflow, report_billing_usage_workflow, track_fallback_model_usage,
    BillingUsageSummary, FallbackModelUsageParams, BILLING_BATCH_SIZE,
};

use super::activities::Activities;
use super::engine::{OverlapPolicy, ScheduleSpec, WorkflowEngine};
use super::ids;
use super::local::LocalWorkflowEngine;
use crate::config::WorkflowsConfig;
use crate::error::Result;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Register every workflow on the engine
pub fn register_all(engine: &LocalWorkflowEngine, activities: &Activities, config: &WorkflowsConfig) {
    let deployments = activities.deployments.clone();
    engine.register_workflow(ids::PROCESS_DEPLOYMENT, move |ctx, params| {
        process_deployment_workflow(ctx, deployments.clone(), params)
    });

    let domains = activities.custom_domains.clone();
    let settings = ReconcileSettings::from(config);
    engine.register_workflow(ids::CUSTOM_DOMAIN_RECONCILE, move |ctx, params| {
        custom_domain_reconcile_workflow(ctx, domains.clone(), settings, params)
    });

    engine.register_workflow(ids::DELAYED_CHAT_RESOLUTION_ANALYSIS, delayed_chat_resolution_workflow);
    let chats = activities.chat_resolutions.clone();
    engine.register_workflow(ids::ANALYZE_CHAT_RESOLUTIONS, move |ctx, params| {
        analyze_chat_resolutions_workflow(ctx, chats.clone(), params)
    });

    let usage = activities.usage.clone();
    engine.register_workflow(ids::REFRESH_BILLING_USAGE, move |ctx, input| {
        refresh_billing_usage_workflow(ctx, usage.clone(), input)
    });
    let usage = activities.usage.clone();
    engine.register_workflow(ids::REPORT_BILLING_USAGE, move |ctx, input| {
        report_billing_usage_workflow(ctx, usage.clone(), input)
    });
    let usage = activities.usage.clone();
    engine.register_workflow(ids::REFRESH_MODEL_PRICING, move |ctx, input| {
        refresh_model_pricing_workflow(ctx, usage.clone(), input)
    });
    let usage = activities.usage.clone();
    engine.register_workflow(ids::COLLECT_PLATFORM_USAGE_METRICS, move |ctx, input| {
        collect_platform_usage_metrics_workflow(ctx, usage.clone(), input)
    });
    let usage = activities.usage.clone();
    engine.register_workflow(ids::FALLBACK_MODEL_USAGE_TRACKING, move |ctx, params| {
        fallback_model_usage_workflow(ctx, usage.clone(), params)
    });

    if let Some(agents) = activities.agents.clone() {
        engine.register_workflow(ids::AGENTS_RESPONSE, move |ctx, input| {
            agents_response_workflow(ctx, agents.clone(), input)
        });
    }

    info!(workflows = engine.registered_workflows().len(), "workflows registered");
}

fn schedule(workflow: &str, workflow_id: String, interval: Duration, config: &WorkflowsConfig) -> ScheduleSpec {
    ScheduleSpec {
        id: ids::schedule_id(&workflow_id),
        workflow: workflow.to_string(),
        workflow_id,
        task_queue: config.task_queue.clone(),
        interval,
        input: Value::Null,
        overlap: OverlapPolicy::Skip,
    }
}

pub fn schedules(config: &WorkflowsConfig) -> Result<Vec<ScheduleSpec>> {
    Ok(vec![
        reconcile_schedule(config)?,
        schedule(ids::REFRESH_BILLING_USAGE, ids::refresh_billing_usage_id(), HOUR, config),
        schedule(ids::REPORT_BILLING_USAGE, ids::report_billing_usage_id(), HOUR, config),
        schedule(ids::REFRESH_MODEL_PRICING, ids::refresh_model_pricing_id(), DAY, config),
        schedule(
            ids::COLLECT_PLATFORM_USAGE_METRICS,
            ids::collect_platform_usage_metrics_id(),
            DAY,
            config,
        ),
    ])
}

/// Create every recurring schedule; existing schedules are kept
pub async fn register_schedules(engine: &dyn WorkflowEngine, config: &WorkflowsConfig) -> Result<()> {
    for spec in schedules(config)? {
        engine.create_schedule(spec).await?;
    }
    Ok(())
}
