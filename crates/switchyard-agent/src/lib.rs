//! Base agent contract and the runtime wrapper shared by every Switchyard agent.
//!
//! An [`Agent`] implements only its domain logic. [`AgentRuntime`] adds the
//! behaviour common to all agents: retry-safe initialization, idempotent
//! shutdown, error and panic containment, per-agent metrics, and an inbox
//! loop that consumes the agent's bus topic on a bounded worker pool.
//!
//! # Main types
//!
//! - [`Agent`] — Trait for concrete agents.
//! - [`AgentRuntime`] — Lifecycle, metrics and inbox around an agent.
//! - [`AgentMetrics`] — Read-only counters exposed to the health monitor.
//! - [`CallTracker`] — Latency/failure accounting for external calls.

/// Agent trait.
pub mod agent;
/// Runtime wrapper and inbox loop.
pub mod runtime;
/// External call accounting.
pub mod tracker;

pub use agent::Agent;
pub use runtime::{AgentMetrics, AgentRuntime, LastError, RuntimeConfig, RuntimeState};
pub use tracker::{CallStats, CallTracker};
