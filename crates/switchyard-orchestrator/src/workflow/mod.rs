//! Declarative workflows: definitions, compiled graphs, executions and the
//! engine that runs them.

/// Workflow and step definitions, graph compilation.
pub mod definition;
/// Step scheduler, retries, compensation, cancellation.
pub mod engine;
/// Execution records.
pub mod execution;

pub use definition::{
    Compensation, Condition, ConditionOp, StepDefinition, StepNode, ValueSource,
    WorkflowDefinition, WorkflowGraph,
};
pub use engine::{CapabilityCaller, WorkflowEngine};
pub use execution::{ExecutionStatus, StepRecord, StepStatus, WorkflowExecution};
