//! Durable workflow engine boundary
//!
//! Workflows are registered by name and exchange JSON values with the
//! engine. Inside a run, [`WorkflowContext`] provides activities with retry,
//! timers, named signal channels and child workflows.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What happens when a workflow id is started again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdReusePolicy {
    /// Any closed execution may be followed by a new one
    AllowDuplicate,
    /// Only failed, terminated or timed-out executions may be restarted
    AllowDuplicateFailedOnly,
    RejectDuplicate,
    /// A running execution is terminated and replaced
    TerminateIfRunning,
}

impl fmt::Display for IdReusePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdReusePolicy::AllowDuplicate => "ALLOW_DUPLICATE",
            IdReusePolicy::AllowDuplicateFailedOnly => "ALLOW_DUPLICATE_FAILED_ONLY",
            IdReusePolicy::RejectDuplicate => "REJECT_DUPLICATE",
            IdReusePolicy::TerminateIfRunning => "TERMINATE_IF_RUNNING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowOptions {
    pub id: String,
    pub task_queue: String,
    pub reuse_policy: IdReusePolicy,
    /// Limit for each run
    pub run_timeout: Option<Duration>,
    /// Delay before the first run starts
    pub start_delay: Option<Duration>,
}

impl StartWorkflowOptions {
    pub fn new<S: Into<String>>(id: S, task_queue: &str) -> Self {
        Self {
            id: id.into(),
            task_queue: task_queue.to_string(),
            reuse_policy: IdReusePolicy::AllowDuplicateFailedOnly,
            run_timeout: None,
            start_delay: None,
        }
    }

    pub fn reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }
}

/// Handle to a started execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_closed(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Snapshot of the latest execution for a workflow id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDescription {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow: String,
    pub task_queue: String,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Number of runs, counting each continue-as-new
    pub runs: u32,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Skip a firing while the previous scheduled run is still going
    #[default]
    Skip,
    AllowAll,
}

/// Recurring workflow start
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub id: String,
    pub workflow: String,
    pub workflow_id: String,
    pub task_queue: String,
    pub interval: Duration,
    pub input: Value,
    pub overlap: OverlapPolicy,
}

/// Client side of the engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn execute_workflow(
        &self,
        workflow: &str,
        options: StartWorkflowOptions,
        input: Value,
    ) -> Result<WorkflowRun>;

    async fn signal_workflow(&self, workflow_id: &str, signal: &str, payload: Value) -> Result<()>;

    /// Signal a running execution, starting it first when none is running
    async fn signal_with_start(
        &self,
        workflow: &str,
        options: StartWorkflowOptions,
        input: Value,
        signal: &str,
        payload: Value,
    ) -> Result<WorkflowRun>;

    async fn describe_execution(&self, workflow_id: &str) -> Result<ExecutionDescription>;

    /// Wait for the execution to close and return its result
    async fn wait_result(&self, workflow_id: &str) -> Result<Value>;

    async fn terminate_workflow(&self, workflow_id: &str, reason: &str) -> Result<()>;

    /// Create a schedule; an existing schedule with the same id is left as is
    async fn create_schedule(&self, schedule: ScheduleSpec) -> Result<()>;
}

/// Result of one workflow run
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowStep<I, O> {
    Complete(O),
    /// Start a fresh run with this input
    ContinueAsNew(I),
}

/// Retry settings for activities
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    /// 0 retries forever
    pub max_attempts: u32,
}

impl Default for ActivityRetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(100),
            max_attempts: 0,
        }
    }
}

impl ActivityRetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(retry as i32);
        Duration::from_secs_f64(base.min(self.max_interval.as_secs_f64()).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    pub start_to_close_timeout: Duration,
    pub retry: ActivityRetryPolicy,
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration, retry: ActivityRetryPolicy) -> Self {
        Self {
            start_to_close_timeout,
            retry,
        }
    }
}

/// Named signal queues of one execution
#[derive(Debug, Default)]
pub struct SignalBus {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    notify: Notify,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn send(&self, signal: &str, payload: Value) {
        self.queues
            .lock()
            .await
            .entry(signal.to_string())
            .or_default()
            .push_back(payload);
        self.notify.notify_waiters();
    }

    async fn try_recv(&self, signal: &str) -> Option<Value> {
        self.queues.lock().await.get_mut(signal).and_then(|q| q.pop_front())
    }

    pub async fn recv(&self, signal: &str) -> Value {
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.try_recv(signal).await {
                return payload;
            }
            notified.await;
        }
    }
}

/// Identity of the current run
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow: String,
    pub task_queue: String,
    /// 1 for the first run, incremented on continue-as-new
    pub run_number: u32,
}

/// Workflow-side handle passed to every run
#[derive(Clone)]
pub struct WorkflowContext {
    info: WorkflowInfo,
    signals: Arc<SignalBus>,
    engine: Arc<dyn WorkflowEngine>,
    cancel: CancellationToken,
}

impl WorkflowContext {
    pub fn new(
        info: WorkflowInfo,
        signals: Arc<SignalBus>,
        engine: Arc<dyn WorkflowEngine>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            info,
            signals,
            engine,
            cancel,
        }
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.info
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::cancelled("workflow cancelled during sleep")),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn receive_signal(&self, signal: &str) -> Result<Value> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::cancelled("workflow cancelled waiting for signal")),
            payload = self.signals.recv(signal) => Ok(payload),
        }
    }

    /// Wait for `signal` or for `timeout` to elapse, whichever comes first
    pub async fn receive_signal_or_timeout(&self, signal: &str, timeout: Duration) -> Result<Option<Value>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::cancelled("workflow cancelled waiting for signal")),
            payload = self.signals.recv(signal) => Ok(Some(payload)),
            _ = tokio::time::sleep(timeout) => Ok(None),
        }
    }

    /// Run an activity with a per-attempt timeout and retries.
    ///
    /// Errors that are not retryable stop immediately.
    pub async fn execute_activity<T, F, Fut>(&self, name: &str, options: &ActivityOptions, mut activity: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(GatewayError::cancelled(format!("activity {} cancelled", name)));
                }
                outcome = tokio::time::timeout(options.start_to_close_timeout, activity()) => outcome,
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => GatewayError::gateway(format!(
                    "activity {} timed out after {:?}",
                    name, options.start_to_close_timeout
                )),
            };

            let exhausted = options.retry.max_attempts != 0 && attempt >= options.retry.max_attempts;
            if exhausted || !err.is_retryable() {
                warn!(
                    workflow_id = %self.info.workflow_id,
                    activity = name,
                    attempt,
                    error = %err,
                    "activity failed"
                );
                return Err(err);
            }

            let delay = options.retry.delay(attempt - 1);
            debug!(
                workflow_id = %self.info.workflow_id,
                activity = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying activity"
            );
            self.sleep(delay).await?;
        }
    }

    /// Start a child workflow and wait for its result
    pub async fn execute_child_workflow(
        &self,
        workflow: &str,
        options: StartWorkflowOptions,
        input: Value,
    ) -> Result<Value> {
        let run = self.engine.execute_workflow(workflow, options, input).await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::cancelled("workflow cancelled waiting for child")),
            result = self.engine.wait_result(&run.workflow_id) => result,
        }
    }

    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = ActivityRetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(5),
            max_attempts: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_signal_bus_buffers_until_received() {
        let bus = Arc::new(SignalBus::new());
        bus.send("reset-timer", Value::from(1)).await;

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.recv("other").await })
        };
        assert_eq!(bus.recv("reset-timer").await, Value::from(1));

        bus.send("other", Value::from("x")).await;
        assert_eq!(waiter.await.unwrap(), Value::from("x"));
    }

    #[test]
    fn test_reuse_policy_names() {
        assert_eq!(IdReusePolicy::RejectDuplicate.to_string(), "REJECT_DUPLICATE");
        assert_eq!(
            serde_json::to_value(IdReusePolicy::AllowDuplicateFailedOnly).unwrap(),
            Value::from("ALLOW_DUPLICATE_FAILED_ONLY")
        );
    }
}
