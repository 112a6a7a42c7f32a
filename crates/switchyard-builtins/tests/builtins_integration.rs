//! Built-in agents behind a live orchestrator: registration, routed queries,
//! error classes across the bus, and a validate-then-execute workflow.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::Arc;
use switchyard_builtins::*;
use switchyard_bus::{BusConfig, MessageBus};
use switchyard_core::{Capability, ErrorClass, SwitchyardError};
use switchyard_orchestrator::workflow::{Condition, ConditionOp, ValueSource};
use switchyard_orchestrator::*;
use switchyard_sandbox::{SandboxExecutor, SandboxLimits};

async fn setup() -> (Orchestrator, Arc<SandboxExecutor>) {
    let bus = MessageBus::new(BusConfig::default());
    bus.start().unwrap();
    let orch = Orchestrator::new(bus, OrchestratorConfig::default()).unwrap();
    let sandbox = Arc::new(SandboxExecutor::in_memory().unwrap());
    sandbox
        .seed(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL NOT NULL);
             INSERT INTO orders (total) VALUES (10.5), (99.0), (3.25);",
        )
        .await
        .unwrap();
    register_builtins(&orch, Arc::clone(&sandbox)).await.unwrap();
    (orch, sandbox)
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registers_three_ready_agents() {
    let (orch, _sandbox) = setup().await;
    let descriptors = orch.descriptors().await;
    assert_eq!(descriptors.len(), 3);
    assert!(descriptors.iter().all(|d| d.state == AgentState::Ready));
    for cap in [
        Capability::ExecuteQuery,
        Capability::ValidateSyntax,
        Capability::IntrospectSchema,
    ] {
        assert!(orch.registry().is_resolvable(cap).await, "{cap}");
    }
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Routed queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn routed_query_returns_rows() {
    let (orch, _sandbox) = setup().await;
    let out = orch
        .route(
            Capability::ExecuteQuery,
            json!({"sql": "SELECT id FROM orders WHERE total > ?1 ORDER BY id", "params": [5]}),
        )
        .await
        .unwrap();
    assert_eq!(out["rows"], json!([[1], [2]]));
    assert_eq!(out["columns"], json!(["id"]));
    orch.shutdown().await;
}

#[tokio::test]
async fn limit_breach_crosses_the_bus_as_resource_limit() {
    let (orch, _sandbox) = setup().await;
    let limits = SandboxLimits {
        max_rows: 1,
        ..SandboxLimits::default()
    };
    let err = orch
        .route(
            Capability::ExecuteQuery,
            json!({"sql": "SELECT * FROM orders", "limits": limits}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::ResourceLimit);

    // A limit breach is not fatal: the agent keeps serving.
    let again = orch
        .route(Capability::ExecuteQuery, json!({"sql": "SELECT 1"}))
        .await;
    assert!(again.is_ok());
    orch.shutdown().await;
}

#[tokio::test]
async fn forbidden_statement_is_a_validation_error() {
    let (orch, _sandbox) = setup().await;
    let err = orch
        .route(Capability::ExecuteQuery, json!({"sql": "DETACH main"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::Validation(_)), "{err}");
    orch.shutdown().await;
}

#[tokio::test]
async fn schema_and_query_metrics() {
    let (orch, _sandbox) = setup().await;
    let schema = orch
        .route(Capability::IntrospectSchema, json!({}))
        .await
        .unwrap();
    assert_eq!(schema["tables"][0]["name"], json!("orders"));

    orch.route(Capability::ExecuteQuery, json!({"sql": "SELECT 1"}))
        .await
        .unwrap();
    let query = orch
        .descriptors()
        .await
        .into_iter()
        .find(|d| d.name == "query")
        .unwrap();
    let slot = orch.registry().get(query.id).await.unwrap();
    let metrics = slot.runtime().metrics();
    assert_eq!(metrics.processed, 1);
    assert_eq!(metrics.external.unwrap().calls, 1);
    orch.shutdown().await;
}

// ---------------------------------------------------------------------------
// Workflow: validate, then execute only when valid
// ---------------------------------------------------------------------------

fn validate_then_execute() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "validate-then-execute",
        vec![
            StepDefinition::new("validate", Capability::ValidateSyntax)
                .with_input("sql", ValueSource::Input { pointer: "/sql".into() }),
            StepDefinition::new("execute", Capability::ExecuteQuery)
                .after("validate")
                .with_input("sql", ValueSource::Input { pointer: "/sql".into() })
                .with_condition(Condition {
                    path: "/steps/validate/valid".into(),
                    op: ConditionOp::Eq,
                    value: json!(true),
                }),
        ],
    )
}

#[tokio::test]
async fn workflow_executes_valid_statement() {
    let (orch, _sandbox) = setup().await;
    let exec = orch
        .workflows()
        .execute(validate_then_execute(), json!({"sql": "SELECT COUNT(*) AS n FROM orders"}))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Succeeded);
    assert_eq!(exec.context["steps"]["execute"]["rows"], json!([[3]]));
    orch.shutdown().await;
}

#[tokio::test]
async fn workflow_skips_execution_of_invalid_statement() {
    let (orch, _sandbox) = setup().await;
    let exec = orch
        .workflows()
        .execute(validate_then_execute(), json!({"sql": "SELECT * FROM nowhere"}))
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Succeeded);
    assert_eq!(exec.step("execute").unwrap().status, StepStatus::Skipped);
    assert_eq!(exec.context["steps"]["validate"]["valid"], json!(false));
    orch.shutdown().await;
}
