use crate::tracker::CallTracker;
use async_trait::async_trait;
use switchyard_core::{Message, SwitchyardResult};

/// Contract every concrete agent satisfies.
///
/// Orchestration code only ever talks to agents through this trait and the
/// [`AgentRuntime`](crate::AgentRuntime) wrapping it, so no agent kind is
/// special-cased.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable agent name, used in logs and as message sender.
    fn name(&self) -> &str;

    /// Prepare the agent. May be called again after a failure, so it must be
    /// safe to retry.
    async fn initialize(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Handle one request. `Ok(Some(value))` becomes the response payload.
    async fn handle(&self, message: &Message) -> SwitchyardResult<Option<serde_json::Value>>;

    /// Release resources. Called at most once per initialization.
    async fn shutdown(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Liveness probe used by the health monitor.
    async fn health_check(&self) -> SwitchyardResult<()> {
        Ok(())
    }

    /// Tracker for calls this agent makes to external systems, if any.
    fn external_calls(&self) -> Option<&CallTracker> {
        None
    }
}
