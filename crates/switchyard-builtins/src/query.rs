use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use switchyard_agent::{Agent, CallTracker};
use switchyard_core::{Message, SwitchyardError, SwitchyardResult};
use switchyard_sandbox::{CommitPolicy, SandboxExecutor, SandboxLimits, SandboxOperation};
use tracing::debug;

/// Payload accepted by [`QueryAgent`].
#[derive(Debug, Deserialize)]
struct QueryRequest {
    sql: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    commit: bool,
    #[serde(default)]
    limits: Option<SandboxLimits>,
}

/// Runs one statement in the sandbox (`execute-query`).
///
/// Payload: `{"sql": "...", "params": [...], "commit": false, "limits": {...}}`.
/// Only `sql` is required. Writes are rolled back unless `commit` is true.
pub struct QueryAgent {
    sandbox: Arc<SandboxExecutor>,
    calls: CallTracker,
}

impl QueryAgent {
    pub fn new(sandbox: Arc<SandboxExecutor>) -> Self {
        Self {
            sandbox,
            calls: CallTracker::new(),
        }
    }
}

#[async_trait]
impl Agent for QueryAgent {
    fn name(&self) -> &str {
        "query"
    }

    async fn handle(&self, message: &Message) -> SwitchyardResult<Option<Value>> {
        let request: QueryRequest = serde_json::from_value(message.payload.clone())
            .map_err(|e| SwitchyardError::Validation(format!("invalid query payload: {e}")))?;
        debug!(commit = request.commit, params = request.params.len(), "Running sandboxed query");

        let mut operation = SandboxOperation::new(request.sql).with_params(request.params);
        if request.commit {
            operation.commit = CommitPolicy::Commit;
        }
        let result = self
            .calls
            .track("sandbox", self.sandbox.run(operation, request.limits.as_ref()))
            .await?;
        Ok(Some(serde_json::to_value(result)?))
    }

    async fn health_check(&self) -> SwitchyardResult<()> {
        self.sandbox.validate("SELECT 1").await
    }

    fn external_calls(&self) -> Option<&CallTracker> {
        Some(&self.calls)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(payload: Value) -> Message {
        Message::request("agent.query", "test", payload)
    }

    #[tokio::test]
    async fn test_select_and_rejected_payload() {
        let sandbox = Arc::new(SandboxExecutor::in_memory().unwrap());
        let agent = QueryAgent::new(sandbox);

        let out = agent
            .handle(&request(json!({"sql": "SELECT ?1 AS v", "params": [3]})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out["rows"], json!([[3]]));
        assert_eq!(out["outcome"], json!("rolled_back"));

        let err = agent.handle(&request(json!({"query": "x"}))).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Validation(_)));

        let stats = agent.external_calls().unwrap().stats();
        assert_eq!(stats.calls, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_commit_flag() {
        let sandbox = Arc::new(SandboxExecutor::in_memory().unwrap());
        sandbox.seed("CREATE TABLE t (x INTEGER)").await.unwrap();
        let agent = QueryAgent::new(Arc::clone(&sandbox));

        agent
            .handle(&request(json!({"sql": "INSERT INTO t VALUES (1)"})))
            .await
            .unwrap();
        agent
            .handle(&request(json!({"sql": "INSERT INTO t VALUES (2)", "commit": true})))
            .await
            .unwrap();
        let out = agent
            .handle(&request(json!({"sql": "SELECT x FROM t"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out["rows"], json!([[2]]));
    }
}
