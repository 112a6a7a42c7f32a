use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_agent::Agent;
use switchyard_core::{Message, SwitchyardResult};
use switchyard_sandbox::SandboxExecutor;

/// Describes the sandbox database (`introspect-schema`): `{"tables": [...]}`.
pub struct SchemaAgent {
    sandbox: Arc<SandboxExecutor>,
}

impl SchemaAgent {
    pub fn new(sandbox: Arc<SandboxExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Agent for SchemaAgent {
    fn name(&self) -> &str {
        "schema"
    }

    async fn handle(&self, _message: &Message) -> SwitchyardResult<Option<Value>> {
        let tables = self.sandbox.schema().await?;
        Ok(Some(json!({ "tables": tables })))
    }
}
