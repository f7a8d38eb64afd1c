//! In-process workflow engine on tokio

use super::engine::{
    ExecutionDescription, ExecutionStatus, IdReusePolicy, OverlapPolicy, ScheduleSpec, SignalBus,
    StartWorkflowOptions, WorkflowContext, WorkflowEngine, WorkflowInfo, WorkflowRun, WorkflowStep,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WorkflowFn = Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<WorkflowStep<Value, Value>>> + Send + Sync>;

struct ExecutionRecord {
    workflow: String,
    task_queue: String,
    run_id: Uuid,
    status: ExecutionStatus,
    result: Option<Value>,
    error: Option<String>,
    runs: u32,
    started_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    signals: Arc<SignalBus>,
    cancel: CancellationToken,
    closed: watch::Receiver<bool>,
}

impl ExecutionRecord {
    fn describe(&self, workflow_id: &str) -> ExecutionDescription {
        ExecutionDescription {
            workflow_id: workflow_id.to_string(),
            run_id: self.run_id,
            workflow: self.workflow.clone(),
            task_queue: self.task_queue.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            runs: self.runs,
            started_at: self.started_at,
            closed_at: self.closed_at,
        }
    }
}

struct Inner {
    workflows: DashMap<String, WorkflowFn>,
    executions: RwLock<HashMap<String, ExecutionRecord>>,
    schedules: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

/// Workflow engine that runs every execution as a tokio task
#[derive(Clone)]
pub struct LocalWorkflowEngine {
    inner: Arc<Inner>,
}

impl Default for LocalWorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalWorkflowEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                workflows: DashMap::new(),
                executions: RwLock::new(HashMap::new()),
                schedules: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a workflow under `name` with typed input and output
    pub fn register_workflow<I, O, F, Fut>(&self, name: &str, handler: F)
    where
        I: DeserializeOwned + Serialize + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowStep<I, O>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let workflow_name = name.to_string();
        let erased: WorkflowFn = Arc::new(move |ctx: WorkflowContext, input: Value| {
            let handler = handler.clone();
            let workflow_name = workflow_name.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(input).map_err(|e| {
                    GatewayError::non_retryable(format!("invalid input for workflow {}: {}", workflow_name, e))
                })?;
                match handler(ctx, input).await? {
                    WorkflowStep::Complete(output) => Ok(WorkflowStep::Complete(serde_json::to_value(output)?)),
                    WorkflowStep::ContinueAsNew(next) => Ok(WorkflowStep::ContinueAsNew(serde_json::to_value(next)?)),
                }
            })
        });
        self.inner.workflows.insert(name.to_string(), erased);
        debug!(workflow = name, "registered workflow");
    }

    pub fn registered_workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.workflows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn schedule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.schedules.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stop schedules and cancel every running execution
    pub fn shutdown(&self) {
        info!("shutting down workflow engine");
        self.inner.shutdown.cancel();
    }

    fn handler(&self, workflow: &str) -> Result<WorkflowFn> {
        self.inner
            .workflows
            .get(workflow)
            .map(|h| h.value().clone())
            .ok_or_else(|| GatewayError::not_found(format!("workflow not registered: {}", workflow)))
    }

    async fn start(&self, workflow: &str, options: StartWorkflowOptions, input: Value) -> Result<(WorkflowRun, Arc<SignalBus>)> {
        let handler = self.handler(workflow)?;
        let workflow_id = options.id.clone();
        let run_id = Uuid::new_v4();
        let signals = Arc::new(SignalBus::new());
        let cancel = self.inner.shutdown.child_token();
        let (closed_tx, closed_rx) = watch::channel(false);

        {
            let mut executions = self.inner.executions.write().await;
            if let Some(existing) = executions.get(&workflow_id) {
                check_reuse(&workflow_id, existing.status, options.reuse_policy)?;
                if !existing.status.is_closed() {
                    // TerminateIfRunning
                    existing.cancel.cancel();
                    info!(workflow_id = %workflow_id, "terminated running execution for restart");
                }
            }
            executions.insert(
                workflow_id.clone(),
                ExecutionRecord {
                    workflow: workflow.to_string(),
                    task_queue: options.task_queue.clone(),
                    run_id,
                    status: ExecutionStatus::Running,
                    result: None,
                    error: None,
                    runs: 1,
                    started_at: Utc::now(),
                    closed_at: None,
                    signals: signals.clone(),
                    cancel: cancel.clone(),
                    closed: closed_rx,
                },
            );
        }

        info!(
            workflow = workflow,
            workflow_id = %workflow_id,
            run_id = %run_id,
            task_queue = %options.task_queue,
            reuse_policy = %options.reuse_policy,
            "workflow started"
        );

        let engine = self.clone();
        let run = WorkflowRun {
            workflow_id: workflow_id.clone(),
            run_id,
        };
        let signals_for_task = signals.clone();
        let workflow = workflow.to_string();
        tokio::spawn(async move {
            engine
                .drive(workflow, options, run_id, handler, input, signals_for_task, cancel)
                .await;
            let _ = closed_tx.send(true);
        });

        Ok((run, signals))
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        workflow: String,
        options: StartWorkflowOptions,
        first_run_id: Uuid,
        handler: WorkflowFn,
        mut input: Value,
        signals: Arc<SignalBus>,
        cancel: CancellationToken,
    ) {
        let workflow_id = options.id.clone();

        if let Some(delay) = options.start_delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.close(&workflow_id, first_run_id, ExecutionStatus::Terminated, None, Some("terminated before start".into())).await;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let mut run_id = first_run_id;
        let mut run_number = 1;
        loop {
            let ctx = WorkflowContext::new(
                WorkflowInfo {
                    workflow_id: workflow_id.clone(),
                    run_id,
                    workflow: workflow.clone(),
                    task_queue: options.task_queue.clone(),
                    run_number,
                },
                signals.clone(),
                Arc::new(self.clone()),
                cancel.clone(),
            );

            let run = handler(ctx, input);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ExecutionStatus::Terminated),
                outcome = maybe_timeout(options.run_timeout, run) => match outcome {
                    Some(result) => Ok(result),
                    None => Err(ExecutionStatus::TimedOut),
                },
            };

            match outcome {
                Ok(Ok(WorkflowStep::Complete(result))) => {
                    self.close(&workflow_id, run_id, ExecutionStatus::Completed, Some(result), None).await;
                    return;
                }
                Ok(Ok(WorkflowStep::ContinueAsNew(next))) => {
                    input = next;
                    run_number += 1;
                    let next_run = Uuid::new_v4();
                    debug!(workflow_id = %workflow_id, run_number, "continuing as new");
                    let mut executions = self.inner.executions.write().await;
                    if let Some(record) = executions.get_mut(&workflow_id).filter(|r| r.run_id == run_id) {
                        record.run_id = next_run;
                        record.runs = run_number;
                    }
                    run_id = next_run;
                }
                Ok(Err(e)) => {
                    error!(workflow_id = %workflow_id, workflow = %workflow, error = %e, "workflow failed");
                    self.close(&workflow_id, run_id, ExecutionStatus::Failed, None, Some(e.to_string())).await;
                    return;
                }
                Err(status) => {
                    warn!(workflow_id = %workflow_id, status = ?status, "workflow stopped");
                    let reason = match status {
                        ExecutionStatus::TimedOut => "workflow run timed out",
                        _ => "workflow terminated",
                    };
                    self.close(&workflow_id, run_id, status, None, Some(reason.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn close(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let mut executions = self.inner.executions.write().await;
        // A restarted id belongs to a newer run
        let Some(record) = executions.get_mut(workflow_id).filter(|r| r.run_id == run_id) else {
            return;
        };
        if record.status.is_closed() {
            return;
        }
        record.status = status;
        record.result = result;
        record.error = error;
        record.closed_at = Some(Utc::now());
        info!(workflow_id = %workflow_id, status = ?status, runs = record.runs, "workflow closed");
    }

    async fn run_schedule(&self, spec: ScheduleSpec, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + spec.interval, spec.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if spec.overlap == OverlapPolicy::Skip {
                if let Ok(description) = self.describe_execution(&spec.workflow_id).await {
                    if description.status == ExecutionStatus::Running {
                        debug!(schedule_id = %spec.id, "previous run still going, skipping");
                        continue;
                    }
                }
            }

            let options = StartWorkflowOptions::new(spec.workflow_id.clone(), &spec.task_queue)
                .reuse_policy(IdReusePolicy::AllowDuplicate);
            if let Err(e) = self.start(&spec.workflow, options, spec.input.clone()).await {
                warn!(schedule_id = %spec.id, error = %e, "scheduled workflow failed to start");
            }
        }
    }
}

fn check_reuse(workflow_id: &str, status: ExecutionStatus, policy: IdReusePolicy) -> Result<()> {
    let allowed = match (status, policy) {
        (_, IdReusePolicy::TerminateIfRunning) => true,
        (ExecutionStatus::Running, _) => false,
        (_, IdReusePolicy::AllowDuplicate) => true,
        (ExecutionStatus::Completed, IdReusePolicy::AllowDuplicateFailedOnly) => false,
        (_, IdReusePolicy::AllowDuplicateFailedOnly) => true,
        (_, IdReusePolicy::RejectDuplicate) => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(GatewayError::non_retryable(format!(
            "workflow execution already started: {} ({:?}, policy {})",
            workflow_id, status, policy
        )))
    }
}

async fn maybe_timeout<F: Future>(timeout: Option<std::time::Duration>, future: F) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

#[async_trait]
impl WorkflowEngine for LocalWorkflowEngine {
    async fn execute_workflow(
        &self,
        workflow: &str,
        options: StartWorkflowOptions,
        input: Value,
    ) -> Result<WorkflowRun> {
        let (run, _) = self.start(workflow, options, input).await?;
        Ok(run)
    }

    async fn signal_workflow(&self, workflow_id: &str, signal: &str, payload: Value) -> Result<()> {
        let signals = {
            let executions = self.inner.executions.read().await;
            match executions.get(workflow_id) {
                Some(record) if !record.status.is_closed() => record.signals.clone(),
                _ => {
                    return Err(GatewayError::not_found(format!(
                        "no running workflow execution: {}",
                        workflow_id
                    )))
                }
            }
        };
        debug!(workflow_id = %workflow_id, signal = signal, "signalling workflow");
        signals.send(signal, payload).await;
        Ok(())
    }

    async fn signal_with_start(
        &self,
        workflow: &str,
        options: StartWorkflowOptions,
        input: Value,
        signal: &str,
        payload: Value,
    ) -> Result<WorkflowRun> {
        let running = {
            let executions = self.inner.executions.read().await;
            executions
                .get(&options.id)
                .filter(|r| !r.status.is_closed())
                .map(|r| (r.run_id, r.signals.clone()))
        };
        if let Some((run_id, signals)) = running {
            signals.send(signal, payload).await;
            return Ok(WorkflowRun {
                workflow_id: options.id,
                run_id,
            });
        }

        let (run, signals) = self.start(workflow, options, input).await?;
        signals.send(signal, payload).await;
        Ok(run)
    }

    async fn describe_execution(&self, workflow_id: &str) -> Result<ExecutionDescription> {
        self.inner
            .executions
            .read()
            .await
            .get(workflow_id)
            .map(|r| r.describe(workflow_id))
            .ok_or_else(|| GatewayError::not_found(format!("workflow execution not found: {}", workflow_id)))
    }

    async fn wait_result(&self, workflow_id: &str) -> Result<Value> {
        let mut closed = self
            .inner
            .executions
            .read()
            .await
            .get(workflow_id)
            .map(|r| r.closed.clone())
            .ok_or_else(|| GatewayError::not_found(format!("workflow execution not found: {}", workflow_id)))?;

        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }

        let description = self.describe_execution(workflow_id).await?;
        match description.status {
            ExecutionStatus::Completed => Ok(description.result.unwrap_or(Value::Null)),
            _ => Err(GatewayError::workflow(
                description
                    .error
                    .unwrap_or_else(|| format!("workflow {:?}", description.status)),
            )),
        }
    }

    async fn terminate_workflow(&self, workflow_id: &str, reason: &str) -> Result<()> {
        let executions = self.inner.executions.read().await;
        match executions.get(workflow_id) {
            Some(record) if !record.status.is_closed() => {
                info!(workflow_id = %workflow_id, reason = reason, "terminating workflow");
                record.cancel.cancel();
                Ok(())
            }
            _ => Err(GatewayError::not_found(format!(
                "no running workflow execution: {}",
                workflow_id
            ))),
        }
    }

    async fn create_schedule(&self, schedule: ScheduleSpec) -> Result<()> {
        if self.inner.schedules.contains_key(&schedule.id) {
            debug!(schedule_id = %schedule.id, "schedule already exists");
            return Ok(());
        }
        if schedule.interval.is_zero() {
            return Err(GatewayError::invalid(format!("schedule {} has a zero interval", schedule.id)));
        }
        self.handler(&schedule.workflow)?;

        let cancel = self.inner.shutdown.child_token();
        self.inner.schedules.insert(schedule.id.clone(), cancel.clone());
        info!(
            schedule_id = %schedule.id,
            workflow = %schedule.workflow,
            interval_secs = schedule.interval.as_secs(),
            "schedule created"
        );

        let engine = self.clone();
        tokio::spawn(async move { engine.run_schedule(schedule, cancel).await });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Count {
        n: u32,
    }

    fn engine() -> LocalWorkflowEngine {
        let engine = LocalWorkflowEngine::new();
        engine.register_workflow("echo", |_ctx: WorkflowContext, input: Value| async move {
            Ok(WorkflowStep::<Value, Value>::Complete(input))
        });
        engine.register_workflow("count", |_ctx: WorkflowContext, input: Count| async move {
            if input.n < 3 {
                Ok(WorkflowStep::ContinueAsNew(Count { n: input.n + 1 }))
            } else {
                Ok(WorkflowStep::Complete(input.n))
            }
        });
        engine.register_workflow("wait", |ctx: WorkflowContext, _input: Value| async move {
            let payload = ctx.receive_signal("go").await?;
            Ok(WorkflowStep::<Value, Value>::Complete(payload))
        });
        engine
    }

    #[tokio::test]
    async fn test_execute_and_wait() {
        let engine = engine();
        let run = engine
            .execute_workflow("echo", StartWorkflowOptions::new("v1:echo", "main"), json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(engine.wait_result(&run.workflow_id).await.unwrap(), json!({"a": 1}));
        let description = engine.describe_execution("v1:echo").await.unwrap();
        assert_eq!(description.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_continue_as_new_counts_runs() {
        let engine = engine();
        engine
            .execute_workflow("count", StartWorkflowOptions::new("v1:count", "main"), json!({"n": 0}))
            .await
            .unwrap();
        assert_eq!(engine.wait_result("v1:count").await.unwrap(), json!(3));
        assert_eq!(engine.describe_execution("v1:count").await.unwrap().runs, 4);
    }

    #[tokio::test]
    async fn test_reuse_policies() {
        let engine = engine();
        let options = |policy| StartWorkflowOptions::new("v1:dup", "main").reuse_policy(policy);

        engine
            .execute_workflow("echo", options(IdReusePolicy::RejectDuplicate), json!(1))
            .await
            .unwrap();
        engine.wait_result("v1:dup").await.unwrap();

        assert!(engine
            .execute_workflow("echo", options(IdReusePolicy::RejectDuplicate), json!(2))
            .await
            .is_err());
        assert!(engine
            .execute_workflow("echo", options(IdReusePolicy::AllowDuplicateFailedOnly), json!(2))
            .await
            .is_err());
        engine
            .execute_workflow("echo", options(IdReusePolicy::AllowDuplicate), json!(3))
            .await
            .unwrap();
        assert_eq!(engine.wait_result("v1:dup").await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_signals_and_terminate_if_running() {
        let engine = engine();
        engine
            .execute_workflow("wait", StartWorkflowOptions::new("v1:wait", "main"), Value::Null)
            .await
            .unwrap();
        assert!(engine
            .execute_workflow("wait", StartWorkflowOptions::new("v1:wait", "main"), Value::Null)
            .await
            .is_err());

        engine
            .execute_workflow(
                "wait",
                StartWorkflowOptions::new("v1:wait", "main").reuse_policy(IdReusePolicy::TerminateIfRunning),
                Value::Null,
            )
            .await
            .unwrap();
        engine.signal_workflow("v1:wait", "go", json!("now")).await.unwrap();
        assert_eq!(engine.wait_result("v1:wait").await.unwrap(), json!("now"));
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_bad_input() {
        let engine = engine();
        assert!(matches!(
            engine
                .execute_workflow("missing", StartWorkflowOptions::new("x", "main"), Value::Null)
                .await,
            Err(GatewayError::NotFound { .. })
        ));

        engine
            .execute_workflow("count", StartWorkflowOptions::new("v1:bad", "main"), json!("nope"))
            .await
            .unwrap();
        assert!(engine.wait_result("v1:bad").await.is_err());
        let description = engine.describe_execution("v1:bad").await.unwrap();
        assert_eq!(description.status, ExecutionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_and_is_idempotent() {
        let engine = LocalWorkflowEngine::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        engine.register_workflow("tick", move |_ctx: WorkflowContext, _input: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(WorkflowStep::<Value, Value>::Complete(Value::Null))
            }
        });

        let spec = ScheduleSpec {
            id: "tick-schedule".into(),
            workflow: "tick".into(),
            workflow_id: "v1:tick".into(),
            task_queue: "main".into(),
            interval: Duration::from_secs(60),
            input: Value::Null,
            overlap: OverlapPolicy::Skip,
        };
        engine.create_schedule(spec.clone()).await.unwrap();
        engine.create_schedule(spec).await.unwrap();
        assert_eq!(engine.schedule_ids(), vec!["tick-schedule".to_string()]);

        tokio::time::sleep(Duration::from_secs(181)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_retries_until_success() {
        use crate::background::engine::{ActivityOptions, ActivityRetryPolicy};

        let engine = LocalWorkflowEngine::new();
        engine.register_workflow("flaky", |ctx: WorkflowContext, _input: Value| async move {
            let attempts = Arc::new(AtomicU32::new(0));
            let options = ActivityOptions::new(Duration::from_secs(5), ActivityRetryPolicy::attempts(5));
            let value = ctx
                .execute_activity("flaky", &options, || {
                    let attempts = attempts.clone();
                    async move {
                        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(GatewayError::gateway("try again"))
                        } else {
                            Ok(attempts.load(Ordering::SeqCst))
                        }
                    }
                })
                .await?;
            Ok(WorkflowStep::<Value, u32>::Complete(value))
        });
        engine
            .execute_workflow("flaky", StartWorkflowOptions::new("v1:flaky", "main"), Value::Null)
            .await
            .unwrap();
        assert_eq!(engine.wait_result("v1:flaky").await.unwrap(), json!(3));
    }

    #[tokio::test]
    async fn test_non_retryable_activity_error_stops() {
        use crate::background::engine::{ActivityOptions, ActivityRetryPolicy};

        let engine = LocalWorkflowEngine::new();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        engine.register_workflow("strict", move |ctx: WorkflowContext, _input: Value| {
            let calls = seen.clone();
            async move {
                let options = ActivityOptions::new(Duration::from_secs(5), ActivityRetryPolicy::attempts(5));
                ctx.execute_activity("strict", &options, || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(GatewayError::non_retryable("bad state"))
                    }
                })
                .await?;
                Ok(WorkflowStep::<Value, Value>::Complete(Value::Null))
            }
        });
        engine
            .execute_workflow("strict", StartWorkflowOptions::new("v1:strict", "main"), Value::Null)
            .await
            .unwrap();
        assert!(engine.wait_result("v1:strict").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
