//! Background workflows
//!
//! The engine interface, an in-process engine on tokio, the activity
//! boundaries and the workflow definitions.

pub mod activities;
mod engine;
pub mod ids;
mod local;
pub mod workflows;

pub use activities::{Activities, AgentResponder, NoopActivities};
pub use engine::{
    ActivityOptions, ActivityRetryPolicy, ExecutionDescription, ExecutionStatus, IdReusePolicy, OverlapPolicy,
    ScheduleSpec, SignalBus, StartWorkflowOptions, WorkflowContext, WorkflowEngine, WorkflowInfo, WorkflowRun,
    WorkflowStep,
};
pub use local::LocalWorkflowEngine;
pub use workflows::{register_all, register_schedules};
