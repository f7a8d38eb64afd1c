//! Periodic custom domain ingress reconciliation
//!
//! Each run reconciles at most one batch of domains and continues as new when
//! more remain, carrying the processed set so a rerun never repeats work.

use crate::background::activities::CustomDomainActivities;
use crate::background::engine::{
    ActivityOptions, ActivityRetryPolicy, IdReusePolicy, OverlapPolicy, ScheduleSpec, StartWorkflowOptions,
    WorkflowContext, WorkflowEngine, WorkflowRun, WorkflowStep,
};
use crate::background::ids;
use crate::config::WorkflowsConfig;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileContinuationState {
    #[serde(default)]
    pub processed_domains: Vec<String>,
    pub reconciled: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomDomainReconcileParams {
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub continuation_state: Option<ReconcileContinuationState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDomainReconcileResult {
    pub total: usize,
    pub reconciled: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub batch_size: usize,
    pub item_delay: Duration,
}

impl From<&WorkflowsConfig> for ReconcileSettings {
    fn from(config: &WorkflowsConfig) -> Self {
        Self {
            batch_size: config.reconcile_batch_size.max(1),
            item_delay: Duration::from_millis(config.reconcile_item_delay_ms),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from(&WorkflowsConfig::default())
    }
}

fn list_options() -> ActivityOptions {
    ActivityOptions::new(Duration::from_secs(60), ActivityRetryPolicy::attempts(3))
}

fn ingress_options() -> ActivityOptions {
    ActivityOptions::new(Duration::from_secs(120), ActivityRetryPolicy::attempts(3))
}

pub async fn custom_domain_reconcile_workflow(
    ctx: WorkflowContext,
    activities: Arc<dyn CustomDomainActivities>,
    settings: ReconcileSettings,
    params: CustomDomainReconcileParams,
) -> Result<WorkflowStep<CustomDomainReconcileParams, CustomDomainReconcileResult>> {
    let organization_id = params.organization_id.clone();
    let domains = ctx
        .execute_activity("list_active_custom_domains", &list_options(), || {
            activities.list_active_custom_domains(&organization_id)
        })
        .await
        .map_err(|e| GatewayError::workflow(format!("failed to list active domains: {}", e)))?;

    let mut state = params.continuation_state.unwrap_or_default();
    let done: HashSet<String> = state.processed_domains.iter().cloned().collect();
    let remaining: Vec<&String> = domains.iter().filter(|d| !done.contains(*d)).collect();

    info!(
        organization_id = %organization_id,
        total = domains.len(),
        remaining = remaining.len(),
        run_number = ctx.info().run_number,
        "reconciling custom domains"
    );

    let mut processed_this_run = 0;
    for domain in remaining {
        if processed_this_run >= settings.batch_size {
            info!(
                processed = state.processed_domains.len(),
                reconciled = state.reconciled,
                failed = state.failed,
                "continuing domain reconcile as new"
            );
            return Ok(WorkflowStep::ContinueAsNew(CustomDomainReconcileParams {
                organization_id,
                continuation_state: Some(state),
            }));
        }
        if processed_this_run > 0 && !settings.item_delay.is_zero() {
            ctx.sleep(settings.item_delay).await?;
        }

        let outcome = ctx
            .execute_activity("ensure_custom_domain_ingress", &ingress_options(), || {
                activities.ensure_custom_domain_ingress(domain)
            })
            .await;
        match outcome {
            Ok(()) => state.reconciled += 1,
            Err(e) => {
                warn!(domain = %domain, error = %e, "failed to reconcile custom domain");
                state.failed += 1;
            }
        }
        state.processed_domains.push(domain.clone());
        processed_this_run += 1;
    }

    info!(reconciled = state.reconciled, failed = state.failed, "custom domain reconcile finished");
    Ok(WorkflowStep::Complete(CustomDomainReconcileResult {
        total: domains.len(),
        reconciled: state.reconciled,
        failed: state.failed,
    }))
}

/// Start a reconcile outside the schedule
pub async fn trigger_custom_domain_reconcile(
    engine: &dyn WorkflowEngine,
    task_queue: &str,
    organization_id: &str,
) -> Result<WorkflowRun> {
    let options = StartWorkflowOptions::new(ids::custom_domain_reconcile_id(), task_queue)
        .reuse_policy(IdReusePolicy::AllowDuplicate);
    let params = CustomDomainReconcileParams {
        organization_id: organization_id.to_string(),
        continuation_state: None,
    };
    engine
        .execute_workflow(ids::CUSTOM_DOMAIN_RECONCILE, options, serde_json::to_value(params)?)
        .await
}

pub fn reconcile_schedule(config: &WorkflowsConfig) -> Result<ScheduleSpec> {
    let workflow_id = ids::custom_domain_reconcile_id();
    Ok(ScheduleSpec {
        id: ids::schedule_id(&workflow_id),
        workflow: ids::CUSTOM_DOMAIN_RECONCILE.to_string(),
        workflow_id,
        task_queue: config.task_queue.clone(),
        interval: Duration::from_secs(config.reconcile_interval_secs),
        input: serde_json::to_value(CustomDomainReconcileParams::default())?,
        overlap: OverlapPolicy::Skip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::engine::{SignalBus, WorkflowInfo};
    use crate::background::LocalWorkflowEngine;
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[derive(Default)]
    struct Domains {
        domains: Vec<String>,
        failing: HashSet<String>,
        list_error: bool,
        listed_for: Mutex<Vec<String>>,
        ensured: Mutex<Vec<String>>,
    }

    impl Domains {
        fn new(domains: Vec<String>) -> Self {
            Self {
                domains,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CustomDomainActivities for Domains {
        async fn list_active_custom_domains(&self, organization_id: &str) -> Result<Vec<String>> {
            self.listed_for.lock().await.push(organization_id.to_string());
            if self.list_error {
                return Err(GatewayError::non_retryable("database connection failed"));
            }
            Ok(self.domains.clone())
        }

        async fn ensure_custom_domain_ingress(&self, domain: &str) -> Result<()> {
            self.ensured.lock().await.push(domain.to_string());
            if self.failing.contains(domain) {
                return Err(GatewayError::non_retryable("simulated failure"));
            }
            Ok(())
        }
    }

    fn numbered(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("domain{:03}.com", i)).collect()
    }

    fn context() -> WorkflowContext {
        WorkflowContext::new(
            WorkflowInfo {
                workflow_id: ids::custom_domain_reconcile_id(),
                run_id: Uuid::new_v4(),
                workflow: ids::CUSTOM_DOMAIN_RECONCILE.into(),
                task_queue: "main".into(),
                run_number: 1,
            },
            Arc::new(SignalBus::new()),
            Arc::new(LocalWorkflowEngine::new()),
            CancellationToken::new(),
        )
    }

    async fn run_once(
        domains: Arc<Domains>,
        params: CustomDomainReconcileParams,
    ) -> Result<WorkflowStep<CustomDomainReconcileParams, CustomDomainReconcileResult>> {
        custom_domain_reconcile_workflow(context(), domains, ReconcileSettings::default(), params).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_and_total_failures_still_complete() {
        let mut domains = Domains::new(vec!["a.com".into(), "b.com".into(), "c.com".into()]);
        domains.failing = ["a.com", "b.com"].iter().map(|d| d.to_string()).collect();
        let domains = Arc::new(domains);

        let step = run_once(domains.clone(), CustomDomainReconcileParams::default())
            .await
            .unwrap();
        assert_eq!(
            step,
            WorkflowStep::Complete(CustomDomainReconcileResult {
                total: 3,
                reconciled: 1,
                failed: 2
            })
        );
        assert_eq!(*domains.ensured.lock().await, vec!["a.com", "b.com", "c.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_batch_completes_without_continuing() {
        let domains = Arc::new(Domains::new(numbered(100)));
        let step = run_once(domains.clone(), CustomDomainReconcileParams::default())
            .await
            .unwrap();
        assert!(matches!(step, WorkflowStep::Complete(ref r) if r.reconciled == 100));
        assert_eq!(domains.ensured.lock().await.len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continues_as_new_after_batch() {
        let domains = Arc::new(Domains::new(numbered(150)));
        let step = run_once(domains.clone(), CustomDomainReconcileParams::default())
            .await
            .unwrap();

        let WorkflowStep::ContinueAsNew(next) = step else {
            panic!("expected continue-as-new");
        };
        let state = next.continuation_state.unwrap();
        assert_eq!(state.processed_domains, numbered(100));
        assert_eq!(state.reconciled, 100);
        assert_eq!(*domains.ensured.lock().await, numbered(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_state_skips_processed_domains() {
        let domains = Arc::new(Domains::new(
            ["a.com", "b.com", "c.com", "d.com", "e.com"].iter().map(|d| d.to_string()).collect(),
        ));
        let params = CustomDomainReconcileParams {
            organization_id: String::new(),
            continuation_state: Some(ReconcileContinuationState {
                processed_domains: vec!["a.com".into(), "b.com".into(), "c.com".into()],
                reconciled: 3,
                failed: 0,
            }),
        };
        let step = run_once(domains.clone(), params).await.unwrap();
        assert_eq!(
            step,
            WorkflowStep::Complete(CustomDomainReconcileResult {
                total: 5,
                reconciled: 5,
                failed: 0
            })
        );
        assert_eq!(*domains.ensured.lock().await, vec!["d.com", "e.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_processed_makes_no_ingress_calls() {
        let domains = Arc::new(Domains::new(vec!["a.com".into(), "b.com".into()]));
        let params = CustomDomainReconcileParams {
            organization_id: String::new(),
            continuation_state: Some(ReconcileContinuationState {
                processed_domains: vec!["a.com".into(), "b.com".into()],
                reconciled: 2,
                failed: 0,
            }),
        };
        run_once(domains.clone(), params).await.unwrap();
        assert!(domains.ensured.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_organization_id_is_passed_to_listing() {
        let domains = Arc::new(Domains::new(vec!["custom.example.com".into()]));
        let params = CustomDomainReconcileParams {
            organization_id: "org_123456".into(),
            continuation_state: None,
        };
        run_once(domains.clone(), params).await.unwrap();
        assert_eq!(*domains.listed_for.lock().await, vec!["org_123456"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failure_fails_workflow() {
        let domains = Arc::new(Domains {
            list_error: true,
            ..Default::default()
        });
        let err = run_once(domains, CustomDomainReconcileParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to list active domains"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_runs_continuations_to_completion() {
        let engine = LocalWorkflowEngine::new();
        let domains = Arc::new(Domains::new(numbered(101)));
        let acts: Arc<dyn CustomDomainActivities> = domains.clone();
        engine.register_workflow(ids::CUSTOM_DOMAIN_RECONCILE, move |ctx, params| {
            custom_domain_reconcile_workflow(ctx, acts.clone(), ReconcileSettings::default(), params)
        });

        let run = trigger_custom_domain_reconcile(&engine, "main", "").await.unwrap();
        let result: CustomDomainReconcileResult =
            serde_json::from_value(engine.wait_result(&run.workflow_id).await.unwrap()).unwrap();
        assert_eq!(result.reconciled, 101);

        let description = engine.describe_execution(&run.workflow_id).await.unwrap();
        assert_eq!(description.runs, 2);
        assert_eq!(domains.ensured.lock().await.len(), 101);
        assert_eq!(domains.listed_for.lock().await.len(), 2);
    }
}
