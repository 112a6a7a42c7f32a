//! Built-in agents for Switchyard.
//!
//! Each agent wraps a shared [`SandboxExecutor`] and answers one capability:
//!
//! - [`QueryAgent`] — `execute-query`
//! - [`ValidatorAgent`] — `validate-syntax`
//! - [`SchemaAgent`] — `introspect-schema`
//!
//! [`register_builtins()`] registers all three with an orchestrator.

/// `execute-query` agent.
pub mod query;
/// `introspect-schema` agent.
pub mod schema;
/// `validate-syntax` agent.
pub mod validator;

pub use query::QueryAgent;
pub use schema::SchemaAgent;
pub use validator::ValidatorAgent;

use std::sync::Arc;
use switchyard_core::{Capability, SwitchyardResult};
use switchyard_orchestrator::{AgentDescriptor, Orchestrator};
use switchyard_sandbox::SandboxExecutor;

/// Register the query, validator and schema agents, returning their
/// descriptors in that order.
pub async fn register_builtins(
    orchestrator: &Orchestrator,
    sandbox: Arc<SandboxExecutor>,
) -> SwitchyardResult<Vec<AgentDescriptor>> {
    let query = orchestrator
        .register(
            Arc::new(QueryAgent::new(Arc::clone(&sandbox))),
            [Capability::ExecuteQuery],
        )
        .await?;
    let validator = orchestrator
        .register(
            Arc::new(ValidatorAgent::new(Arc::clone(&sandbox))),
            [Capability::ValidateSyntax],
        )
        .await?;
    let schema = orchestrator
        .register(Arc::new(SchemaAgent::new(sandbox)), [Capability::IntrospectSchema])
        .await?;
    Ok(vec![query, validator, schema])
}
