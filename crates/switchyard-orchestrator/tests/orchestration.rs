//! End-to-end orchestration over a live bus: routing, lifecycle, workflows
//! and persistence.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_agent::Agent;
use switchyard_bus::{BusConfig, MessageBus};
use switchyard_core::{Capability, ErrorClass, Message, RetryPolicy, SwitchyardError, SwitchyardResult};
use switchyard_orchestrator::workflow::{Compensation, ValueSource};
use switchyard_orchestrator::*;

/// Sleeps `delay_ms`, counts calls, then echoes or fails.
struct Worker {
    name: &'static str,
    delay_ms: u64,
    fail: bool,
    calls: AtomicU32,
}

impl Worker {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay_ms: 0,
            fail: false,
            calls: AtomicU32::new(0),
        })
    }

    fn slow(name: &'static str, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay_ms,
            fail: false,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay_ms: 0,
            fail: true,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for Worker {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, message: &Message) -> SwitchyardResult<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            return Err(SwitchyardError::Handler(format!("{} failed", self.name)));
        }
        Ok(Some(json!({"agent": self.name, "input": message.payload})))
    }
}

struct NeverReady;

#[async_trait]
impl Agent for NeverReady {
    fn name(&self) -> &str {
        "never-ready"
    }

    async fn initialize(&self) -> SwitchyardResult<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    async fn handle(&self, _message: &Message) -> SwitchyardResult<Option<Value>> {
        Ok(None)
    }
}

fn orchestrator() -> Orchestrator {
    let bus = MessageBus::new(BusConfig::default());
    bus.start().unwrap();
    Orchestrator::new(
        bus,
        OrchestratorConfig {
            startup_timeout_ms: 200,
            request_timeout_ms: 2_000,
            drain_timeout_ms: 2_000,
            ..Default::default()
        },
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_capability_set_creates_no_descriptor() {
    let orch = orchestrator();
    let err = orch
        .register(Worker::new("w"), Vec::<Capability>::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::Validation(_)));
    assert!(orch.registry().is_empty().await);
}

#[tokio::test]
async fn startup_timeout_leaves_agent_failed() {
    let orch = orchestrator();
    let d = orch
        .register(Arc::new(NeverReady), [Capability::Summarize])
        .await
        .unwrap();
    assert_eq!(d.state, AgentState::Failed);
    assert!(d.last_error.unwrap().contains("initialize exceeded"));
    let err = orch.route(Capability::Summarize, json!({})).await.unwrap_err();
    assert!(matches!(err, SwitchyardError::NoCapableAgent(Capability::Summarize)));
}

// ---------------------------------------------------------------------------
// Routing only ever picks ready agents
// ---------------------------------------------------------------------------

#[tokio::test]
async fn route_skips_busy_agents() {
    let orch = orchestrator();
    let a = Worker::slow("a", 200);
    let b = Worker::slow("b", 200);
    orch.register(a.clone(), [Capability::ExecuteQuery]).await.unwrap();
    orch.register(b.clone(), [Capability::ExecuteQuery]).await.unwrap();

    let first = tokio::spawn({
        let orch = orch.clone();
        async move { orch.route(Capability::ExecuteQuery, json!(1)).await }
    });
    let second = tokio::spawn({
        let orch = orch.clone();
        async move { orch.route(Capability::ExecuteQuery, json!(2)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both agents are busy now.
    let busy = orch
        .descriptors()
        .await
        .iter()
        .filter(|d| d.state == AgentState::Busy)
        .count();
    assert_eq!(busy, 2);
    let err = orch.route(Capability::ExecuteQuery, json!(3)).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Routing);

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    for d in orch.descriptors().await {
        assert_eq!(d.state, AgentState::Ready);
    }
}

#[tokio::test]
async fn deregister_lets_in_flight_call_finish() {
    let orch = orchestrator();
    let w = Worker::slow("w", 150);
    let d = orch.register(w.clone(), [Capability::Summarize]).await.unwrap();

    let call = tokio::spawn({
        let orch = orch.clone();
        async move { orch.route(Capability::Summarize, json!("x")).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    orch.deregister(d.id).await.unwrap();

    let out = call.await.unwrap().unwrap();
    assert_eq!(out["agent"], "w");
    assert!(orch.descriptor(d.id).await.is_none());
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_middle_step_compensates_first_step_once() {
    let orch = orchestrator();
    let a = Worker::new("a");
    let b = Worker::failing("b");
    let c = Worker::new("c");
    let undo = Worker::new("undo");
    orch.register(a.clone(), [Capability::GenerateSql]).await.unwrap();
    orch.register(b.clone(), [Capability::ValidateSyntax]).await.unwrap();
    orch.register(c.clone(), [Capability::ExecuteQuery]).await.unwrap();
    orch.register(undo.clone(), [Capability::Summarize]).await.unwrap();

    let def = WorkflowDefinition::new(
        "a-b-c",
        vec![
            StepDefinition::new("a", Capability::GenerateSql).with_compensation(Compensation {
                capability: Capability::Summarize,
                input: BTreeMap::from([(
                    "undo".to_string(),
                    ValueSource::Step {
                        step: "a".into(),
                        pointer: "/agent".into(),
                    },
                )]),
            }),
            StepDefinition::new("b", Capability::ValidateSyntax)
                .after("a")
                .with_retry(RetryPolicy::none().with_max_attempts(3)),
            StepDefinition::new("c", Capability::ExecuteQuery).after("b"),
        ],
    );
    let exec = orch.workflows().execute(def, json!({})).await.unwrap();

    assert!(matches!(exec.status, ExecutionStatus::Failed { .. }));
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 3);
    assert_eq!(c.calls(), 0);
    assert_eq!(undo.calls(), 1);
    assert!(exec.step("a").unwrap().compensated);
    assert_eq!(exec.step("c").unwrap().status, StepStatus::Pending);
}

#[tokio::test]
async fn cancel_between_steps() {
    let orch = orchestrator();
    let first = Worker::slow("first", 150);
    let second = Worker::new("second");
    orch.register(first.clone(), [Capability::GenerateSql]).await.unwrap();
    orch.register(second.clone(), [Capability::ExecuteQuery]).await.unwrap();

    let def = WorkflowDefinition::new(
        "two-step",
        vec![
            StepDefinition::new("one", Capability::GenerateSql),
            StepDefinition::new("two", Capability::ExecuteQuery).after("one"),
        ],
    );
    let outcome = orch
        .submit(TaskRequest::Workflow {
            definition: def,
            input: json!({}),
        })
        .await;
    let TaskOutcome::Pending(id) = outcome else {
        panic!("expected pending outcome, got {outcome:?}");
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    orch.cancel(id).unwrap();

    let exec = orch.workflows().wait(id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.step("one").unwrap().status, StepStatus::Succeeded);
    assert_eq!(exec.context["steps"]["one"]["agent"], "first");
    assert_eq!(exec.step("two").unwrap().status, StepStatus::Pending);
    assert_eq!(second.calls(), 0);
}

#[tokio::test]
async fn workflow_with_missing_capability_fails_fast() {
    let orch = orchestrator();
    let w = Worker::new("w");
    orch.register(w.clone(), [Capability::ExecuteQuery]).await.unwrap();
    let def = WorkflowDefinition::new(
        "needs-llm",
        vec![
            StepDefinition::new("run", Capability::ExecuteQuery),
            StepDefinition::new("gen", Capability::GenerateSql).after("run"),
        ],
    );
    let exec = orch.workflows().execute(def, json!({})).await.unwrap();
    assert!(matches!(exec.status, ExecutionStatus::Failed { .. }));
    assert_eq!(w.calls(), 0);
}

// ---------------------------------------------------------------------------
// Persistence round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn persisted_state_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(tmp.path()).await.unwrap());
    let bus = MessageBus::new(BusConfig::default());
    bus.start().unwrap();
    let orch = Orchestrator::with_store(bus, OrchestratorConfig::default(), store.clone()).unwrap();

    let d = orch
        .register(Worker::new("w"), [Capability::ExecuteQuery, Capability::Summarize])
        .await
        .unwrap();
    let stored = store.load_agent(d.id).await.unwrap().unwrap();
    assert_eq!(stored.id, d.id);
    assert_eq!(stored.state, AgentState::Ready);
    assert_eq!(stored.capabilities, d.capabilities);

    let def = WorkflowDefinition::new(
        "single",
        vec![StepDefinition::new("run", Capability::ExecuteQuery)
            .with_input("sql", ValueSource::Input { pointer: "/sql".into() })],
    );
    let exec = orch
        .workflows()
        .execute(def, json!({"sql": "SELECT 1"}))
        .await
        .unwrap();
    let reloaded = store.load_execution(exec.id).await.unwrap().unwrap();
    assert_eq!(reloaded, exec);
    assert_eq!(reloaded.context["steps"]["run"]["input"]["sql"], "SELECT 1");

    // A fresh orchestrator over the same directory sees the execution.
    let bus = MessageBus::new(BusConfig::default());
    let again = Orchestrator::with_store(bus, OrchestratorConfig::default(), store.clone()).unwrap();
    assert_eq!(again.recover().await.unwrap(), 1);
    assert_eq!(again.execution(exec.id), Some(exec));

    orch.deregister(d.id).await.unwrap();
    assert!(store.load_agent(d.id).await.unwrap().is_none());
}
