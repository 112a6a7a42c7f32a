use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use switchyard_agent::Agent;
use switchyard_core::{Message, SwitchyardError, SwitchyardResult};
use switchyard_sandbox::SandboxExecutor;

/// Checks whether a statement would be accepted by the sandbox
/// (`validate-syntax`). Answers `{"valid": bool, "error": "..."}`; an invalid
/// statement is a normal answer, not a handler failure.
pub struct ValidatorAgent {
    sandbox: Arc<SandboxExecutor>,
}

impl ValidatorAgent {
    pub fn new(sandbox: Arc<SandboxExecutor>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Agent for ValidatorAgent {
    fn name(&self) -> &str {
        "validator"
    }

    async fn handle(&self, message: &Message) -> SwitchyardResult<Option<Value>> {
        let sql = message
            .payload
            .get("sql")
            .and_then(Value::as_str)
            .ok_or_else(|| SwitchyardError::Validation("payload must carry 'sql'".into()))?;
        match self.sandbox.validate(sql).await {
            Ok(()) => Ok(Some(json!({"valid": true}))),
            Err(SwitchyardError::Validation(reason)) => {
                Ok(Some(json!({"valid": false, "error": reason})))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_validity() {
        let sandbox = Arc::new(SandboxExecutor::in_memory().unwrap());
        sandbox.seed("CREATE TABLE t (x INTEGER)").await.unwrap();
        let agent = ValidatorAgent::new(sandbox);

        let ok = agent
            .handle(&Message::request("v", "test", json!({"sql": "SELECT x FROM t"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok, json!({"valid": true}));

        let bad = agent
            .handle(&Message::request("v", "test", json!({"sql": "DROP TABLE t; SELECT 1"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bad["valid"], json!(false));
        assert!(bad["error"].as_str().unwrap().contains("single statement"));

        assert!(agent
            .handle(&Message::request("v", "test", json!({})))
            .await
            .is_err());
    }
}
