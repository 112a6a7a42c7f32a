use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use switchyard_core::{Capability, SwitchyardError, SwitchyardResult};
use uuid::Uuid;

/// Lifecycle state of a registered agent.
///
/// ```text
/// unregistered -> initializing -> ready <-> busy
/// ready | busy -> failed -> initializing      (restart)
/// ready | busy | initializing | failed -> draining -> stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Unregistered,
    Initializing,
    Ready,
    Busy,
    Draining,
    Stopped,
    Failed,
}

impl AgentState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Unregistered, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Initializing, Draining)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Ready, Failed)
                | (Busy, Failed)
                | (Ready, Draining)
                | (Busy, Draining)
                | (Failed, Initializing)
                | (Failed, Draining)
                | (Draining, Stopped)
        )
    }

    /// Whether the agent can take (or is taking) routed work.
    pub fn is_serving(self) -> bool {
        matches!(self, AgentState::Ready | AgentState::Busy)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Unregistered => "unregistered",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Busy => "busy",
            AgentState::Draining => "draining",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of the work an agent has done through the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub in_flight: u32,
    pub processed: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

impl ResourceUsage {
    /// Fold one finished call into the running average.
    pub fn record(&mut self, latency_ms: f64, failed: bool) {
        let n = self.processed as f64;
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms) / (n + 1.0);
        self.processed += 1;
        if failed {
            self.errors += 1;
        }
    }
}

/// The registry's record of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_dispatched: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default)]
    pub restart_attempts: u32,
    #[serde(default)]
    pub missed_health_checks: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl AgentDescriptor {
    pub fn new(id: Uuid, name: impl Into<String>, capabilities: BTreeSet<Capability>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            capabilities,
            state: AgentState::Unregistered,
            registered_at: now,
            state_changed_at: now,
            last_health_check: None,
            last_dispatched: None,
            resource_usage: ResourceUsage::default(),
            restart_attempts: 0,
            missed_health_checks: 0,
            last_error: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: AgentState) -> SwitchyardResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SwitchyardError::Registry(format!(
                "agent {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        self.state_changed_at = Utc::now();
        Ok(())
    }

    pub fn offers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Inbox topic the agent's runtime subscribes to.
    pub fn topic(&self) -> String {
        agent_topic(self.id)
    }
}

/// Inbox topic for agent `id`.
pub fn agent_topic(id: Uuid) -> String {
    format!("agent.{id}")
}
