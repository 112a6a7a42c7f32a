//! Agent registry, routing orchestrator, health monitor and workflow engine.
//!
//! The [`Orchestrator`] owns the authoritative set of live agents. Each agent
//! is wrapped in an [`AgentRuntime`](switchyard_agent::AgentRuntime) whose
//! inbox is a bus topic; capability calls are routed to a `ready` agent as
//! request messages and resolved by correlated replies.
//!
//! # Main types
//!
//! - [`Orchestrator`] — register, route, deregister, submit, health.
//! - [`AgentRegistry`] — Descriptor table with per-descriptor locks.
//! - [`AgentDescriptor`] — Registry record and lifecycle state machine.
//! - [`HealthMonitor`] — Periodic probes, failure detection, bounded restarts.
//! - [`WorkflowEngine`] — Runs [`WorkflowDefinition`]s as [`WorkflowExecution`]s.
//! - [`FileStateStore`] — JSON persistence for descriptors and executions.

/// Orchestrator and health configuration.
pub mod config;
/// Agent descriptors and lifecycle states.
pub mod descriptor;
/// Health monitoring and restarts.
pub mod health;
/// Routing front end.
pub mod orchestrator;
/// Descriptor table and agent claiming.
pub mod registry;
/// Persistence of descriptors and executions.
pub mod store;
/// Workflow definitions and engine.
pub mod workflow;

pub use config::{HealthConfig, OrchestratorConfig};
pub use descriptor::{agent_topic, AgentDescriptor, AgentState, ResourceUsage};
pub use health::{HealthMonitor, HealthReport};
pub use orchestrator::{
    HealthStatus, Orchestrator, SystemHealth, TaskFailure, TaskOutcome, TaskRequest,
};
pub use registry::{AgentRegistry, AgentSlot, CallOutcome, Claim};
pub use store::{FileStateStore, StateStore};
pub use workflow::{
    CapabilityCaller, ExecutionStatus, StepDefinition, StepStatus, WorkflowDefinition,
    WorkflowEngine, WorkflowExecution,
};
