//! Chat resolution analysis after a period of inactivity

use crate::background::activities::{AnalyzeSegmentArgs, ChatResolutionActivities};
use crate::background::engine::{
    ActivityOptions, ActivityRetryPolicy, IdReusePolicy, StartWorkflowOptions, WorkflowContext, WorkflowEngine,
    WorkflowRun, WorkflowStep,
};
use crate::background::ids;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RESET_TIMER_SIGNAL: &str = "reset-timer";
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResolutionParams {
    pub chat_id: Uuid,
    pub project_id: Uuid,
    pub organization_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResolutionSummary {
    pub segments: usize,
    pub analyzed: usize,
    pub failed: usize,
}

fn activity_options() -> ActivityOptions {
    ActivityOptions::new(Duration::from_secs(5 * 60), ActivityRetryPolicy::attempts(3))
}

/// Waits until the chat has been quiet for the inactivity timeout, restarting
/// the timer on every `reset-timer` signal, then runs the analysis.
pub async fn delayed_chat_resolution_workflow(
    ctx: WorkflowContext,
    params: ChatResolutionParams,
) -> Result<WorkflowStep<ChatResolutionParams, ChatResolutionSummary>> {
    let deadline = Instant::now() + MAX_WAIT;
    let mut resets = 0u32;

    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            info!(chat_id = %params.chat_id, resets, "maximum wait reached, analysing chat");
            break;
        }
        match ctx
            .receive_signal_or_timeout(RESET_TIMER_SIGNAL, INACTIVITY_TIMEOUT.min(left))
            .await?
        {
            Some(_) => {
                resets += 1;
                debug!(chat_id = %params.chat_id, resets, "chat activity, timer reset");
            }
            None => break,
        }
    }

    let options = StartWorkflowOptions::new(ids::analyze_chat_resolutions_id(params.chat_id), &ctx.info().task_queue)
        .reuse_policy(IdReusePolicy::AllowDuplicate);
    let summary = ctx
        .execute_child_workflow(ids::ANALYZE_CHAT_RESOLUTIONS, options, serde_json::to_value(&params)?)
        .await?;
    Ok(WorkflowStep::Complete(serde_json::from_value(summary)?))
}

/// Feedback, segmentation, cleanup of earlier resolutions, then one analysis per segment
pub async fn analyze_chat_resolutions_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn ChatResolutionActivities>,
    params: ChatResolutionParams,
) -> Result<WorkflowStep<ChatResolutionParams, ChatResolutionSummary>> {
    let options = activity_options();
    let (chat_id, project_id) = (params.chat_id, params.project_id);

    let feedback = ctx
        .execute_activity("fetch_user_feedback", &options, || {
            activities.fetch_user_feedback(chat_id, project_id)
        })
        .await?;
    let segments = ctx
        .execute_activity("segment_chat", &options, || {
            activities.segment_chat(chat_id, project_id, &params.organization_id, &feedback)
        })
        .await?;
    ctx.execute_activity("delete_chat_resolutions", &options, || {
        activities.delete_chat_resolutions(chat_id, project_id)
    })
    .await?;

    let mut summary = ChatResolutionSummary {
        segments: segments.len(),
        ..Default::default()
    };
    for segment in segments {
        let args = AnalyzeSegmentArgs {
            chat_id,
            project_id,
            organization_id: params.organization_id.clone(),
            segment,
            user_feedback: feedback
                .iter()
                .filter(|f| f.message_index >= segment.start_index && f.message_index <= segment.end_index)
                .cloned()
                .collect(),
        };
        match ctx
            .execute_activity("analyze_segment", &options, || activities.analyze_segment(&args))
            .await
        {
            Ok(()) => summary.analyzed += 1,
            Err(e) => {
                warn!(
                    chat_id = %chat_id,
                    start_index = segment.start_index,
                    end_index = segment.end_index,
                    error = %e,
                    "segment analysis failed"
                );
                summary.failed += 1;
            }
        }
    }

    info!(
        chat_id = %chat_id,
        segments = summary.segments,
        analyzed = summary.analyzed,
        failed = summary.failed,
        "chat resolutions analysed"
    );
    Ok(WorkflowStep::Complete(summary))
}

/// Start the delayed analysis for a chat, or reset its timer when already waiting
pub async fn schedule_chat_resolution_analysis(
    engine: &dyn WorkflowEngine,
    task_queue: &str,
    params: ChatResolutionParams,
) -> Result<WorkflowRun> {
    let options = StartWorkflowOptions::new(ids::delayed_chat_resolution_id(params.chat_id), task_queue)
        .reuse_policy(IdReusePolicy::AllowDuplicate);
    engine
        .signal_with_start(
            ids::DELAYED_CHAT_RESOLUTION_ANALYSIS,
            options,
            serde_json::to_value(&params)?,
            RESET_TIMER_SIGNAL,
            Value::Null,
        )
        .await
}
