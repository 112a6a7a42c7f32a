use crate::config::OrchestratorConfig;
use crate::descriptor::{agent_topic, AgentDescriptor, AgentState};
use crate::registry::{AgentRegistry, AgentSlot, CallOutcome};
use crate::store::StateStore;
use crate::workflow::{CapabilityCaller, WorkflowDefinition, WorkflowEngine, WorkflowExecution};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_agent::{Agent, AgentRuntime};
use switchyard_bus::{handler_fn, BusHealth, MessageBus, SubscriptionId};
use switchyard_core::{
    Capability, ErrorClass, Message, SwitchyardError, SwitchyardResult,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sender name on requests the orchestrator publishes.
pub const ORCHESTRATOR_SENDER: &str = "orchestrator";

/// Inbound work: one capability call or a whole workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRequest {
    Capability {
        capability: Capability,
        #[serde(default)]
        payload: Value,
    },
    Workflow {
        definition: WorkflowDefinition,
        #[serde(default)]
        input: Value,
    },
}

/// A typed failure as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
}

impl From<&SwitchyardError> for TaskFailure {
    fn from(err: &SwitchyardError) -> Self {
        Self {
            class: err.class(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// What a caller gets back from [`Orchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed(Value),
    Failed(TaskFailure),
    /// Workflow accepted; poll [`Orchestrator::execution`] with this id.
    Pending(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Aggregate view of the bus and every registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub bus: BusHealth,
    pub agents: BTreeMap<AgentState, usize>,
    pub pending_requests: usize,
}

struct OrchestratorInner {
    bus: MessageBus,
    config: OrchestratorConfig,
    registry: AgentRegistry,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Arc<Message>>>>,
    store: Option<Arc<dyn StateStore>>,
    reply_subscription: Mutex<Option<SubscriptionId>>,
}

/// Removes a pending reply slot on every exit path of a routed call.
struct PendingReply<'a> {
    pending: &'a Mutex<HashMap<Uuid, oneshot::Sender<Arc<Message>>>>,
    id: Uuid,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

/// Registers agents, routes capability calls to them over the bus, and runs
/// workflows.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
    workflows: WorkflowEngine,
}

impl Orchestrator {
    pub fn new(bus: MessageBus, config: OrchestratorConfig) -> SwitchyardResult<Self> {
        Self::build(bus, config, None)
    }

    /// Orchestrator that persists descriptors and executions to `store`.
    pub fn with_store(
        bus: MessageBus,
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
    ) -> SwitchyardResult<Self> {
        Self::build(bus, config, Some(store))
    }

    fn build(
        bus: MessageBus,
        config: OrchestratorConfig,
        store: Option<Arc<dyn StateStore>>,
    ) -> SwitchyardResult<Self> {
        config.validate()?;
        let inner = Arc::new(OrchestratorInner {
            bus: bus.clone(),
            config,
            registry: AgentRegistry::new(),
            pending: Mutex::new(HashMap::new()),
            store: store.clone(),
            reply_subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = bus.subscribe(
            &inner.config.reply_topic,
            handler_fn(move |reply: Arc<Message>| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.deliver_reply(reply);
                    }
                    Ok::<(), SwitchyardError>(())
                }
            }),
        )?;
        *inner.reply_subscription.lock() = Some(subscription);

        let mut workflows = WorkflowEngine::new(Arc::clone(&inner) as Arc<dyn CapabilityCaller>);
        if let Some(store) = store {
            workflows = workflows.with_store(store);
        }
        Ok(Self { inner, workflows })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    /// Register `agent` offering `capabilities`.
    ///
    /// An empty capability set is rejected before any descriptor exists.
    /// Otherwise the returned descriptor is `ready` if the agent initialized
    /// within the startup timeout, else `failed` (and eligible for restart by
    /// the health monitor).
    pub async fn register(
        &self,
        agent: Arc<dyn Agent>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> SwitchyardResult<AgentDescriptor> {
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        if capabilities.is_empty() {
            return Err(SwitchyardError::Validation(format!(
                "agent '{}' must declare at least one capability",
                agent.name()
            )));
        }

        let id = Uuid::new_v4();
        let runtime = Arc::new(AgentRuntime::new(
            id,
            agent,
            self.inner.config.runtime.clone(),
        ));
        let mut descriptor = AgentDescriptor::new(id, runtime.name(), capabilities);
        descriptor.transition(AgentState::Initializing)?;
        let slot = Arc::new(AgentSlot::new(descriptor, runtime));
        self.inner.registry.insert(Arc::clone(&slot)).await;
        info!(agent_id = %id, agent = %slot.runtime().name(), "Agent registered");

        self.inner.start_agent(&slot).await;
        Ok(slot.descriptor())
    }

    /// Route one capability call to a ready agent and await its reply.
    pub async fn route(&self, capability: Capability, payload: Value) -> SwitchyardResult<Value> {
        self.inner.route(capability, payload).await
    }

    /// Drain, stop and remove an agent. In-flight calls may finish until the
    /// drain timeout elapses.
    pub async fn deregister(&self, id: Uuid) -> SwitchyardResult<()> {
        let inner = &self.inner;
        let slot = inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| SwitchyardError::NotFound(format!("agent {id}")))?;
        slot.update(|d| d.transition(AgentState::Draining))?;
        inner.persist_agent(&slot).await;
        info!(agent_id = %id, "Agent draining");

        let deadline = Instant::now() + Duration::from_millis(inner.config.drain_timeout_ms);
        while slot.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(agent_id = %id, in_flight = slot.in_flight(), "Drain timeout elapsed");
                break;
            }
            let _ = tokio::time::timeout(remaining, slot.idle_signal()).await;
        }

        slot.update(|d| d.transition(AgentState::Stopped))?;
        if let Err(e) = slot.runtime().shutdown().await {
            warn!(agent_id = %id, error = %e, "Agent shutdown failed");
        }
        inner.registry.remove(id).await;
        if let Some(store) = &inner.store {
            if let Err(e) = store.delete_agent(id).await {
                warn!(agent_id = %id, error = %e, "Failed to delete persisted descriptor");
            }
        }
        info!(agent_id = %id, "Agent stopped");
        Ok(())
    }

    /// Move a serving agent to `failed`.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> SwitchyardResult<()> {
        let slot = self.slot(id).await?;
        slot.update(|d| {
            d.transition(AgentState::Failed)?;
            d.last_error = Some(reason.to_string());
            Ok::<(), SwitchyardError>(())
        })?;
        warn!(agent_id = %id, reason = %reason, "Agent marked failed");
        self.inner.persist_agent(&slot).await;
        Ok(())
    }

    /// Re-run initialization of a failed agent. Counts against its restart
    /// budget and returns the state it ended in.
    pub async fn restart(&self, id: Uuid) -> SwitchyardResult<AgentState> {
        let slot = self.slot(id).await?;
        let attempt = slot.update(|d| {
            d.transition(AgentState::Initializing)?;
            d.restart_attempts += 1;
            Ok::<u32, SwitchyardError>(d.restart_attempts)
        })?;
        info!(agent_id = %id, attempt, "Restarting agent");
        slot.runtime().stop_inbox();
        Ok(self.inner.start_agent(&slot).await)
    }

    /// Inbound task boundary. Never fails: errors come back as
    /// [`TaskOutcome::Failed`].
    pub async fn submit(&self, request: TaskRequest) -> TaskOutcome {
        match request {
            TaskRequest::Capability {
                capability,
                payload,
            } => match self.route(capability, payload).await {
                Ok(value) => TaskOutcome::Completed(value),
                Err(e) => TaskOutcome::Failed(TaskFailure::from(&e)),
            },
            TaskRequest::Workflow { definition, input } => {
                match self.workflows.start(definition, input).await {
                    Ok(id) => TaskOutcome::Pending(id),
                    Err(e) => TaskOutcome::Failed(TaskFailure::from(&e)),
                }
            }
        }
    }

    pub fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.workflows.execution(id)
    }

    pub fn cancel(&self, execution_id: Uuid) -> SwitchyardResult<()> {
        self.workflows.cancel(execution_id)
    }

    pub async fn descriptor(&self, id: Uuid) -> Option<AgentDescriptor> {
        self.inner.registry.get(id).await.map(|s| s.descriptor())
    }

    pub async fn descriptors(&self) -> Vec<AgentDescriptor> {
        self.inner.registry.descriptors().await
    }

    /// Load persisted workflow executions. Returns how many were loaded.
    pub async fn recover(&self) -> SwitchyardResult<usize> {
        self.workflows.recover().await
    }

    pub async fn health(&self) -> SystemHealth {
        let bus = self.inner.bus.health();
        let mut agents = BTreeMap::new();
        for d in self.inner.registry.descriptors().await {
            *agents.entry(d.state).or_insert(0) += 1;
        }
        let status = match bus {
            BusHealth::Failed { .. } => HealthStatus::Failed,
            BusHealth::Healthy if !agents.contains_key(&AgentState::Failed) => {
                HealthStatus::Healthy
            }
            _ => HealthStatus::Degraded,
        };
        SystemHealth {
            status,
            bus,
            agents,
            pending_requests: self.inner.pending.lock().len(),
        }
    }

    /// Deregister every agent and detach from the reply topic. The bus is
    /// left running.
    pub async fn shutdown(&self) {
        for slot in self.inner.registry.slots().await {
            if let Err(e) = self.deregister(slot.id()).await {
                warn!(agent_id = %slot.id(), error = %e, "Deregister during shutdown failed");
            }
        }
        if let Some(sub) = self.inner.reply_subscription.lock().take() {
            self.inner.bus.unsubscribe(&self.inner.config.reply_topic, sub);
        }
        info!("Orchestrator shut down");
    }

    async fn slot(&self, id: Uuid) -> SwitchyardResult<Arc<AgentSlot>> {
        self.inner
            .registry
            .get(id)
            .await
            .ok_or_else(|| SwitchyardError::NotFound(format!("agent {id}")))
    }
}

impl OrchestratorInner {
    fn deliver_reply(&self, reply: Arc<Message>) {
        let Some(correlation) = reply.correlation_id else {
            debug!(message_id = %reply.id, "Reply without correlation id ignored");
            return;
        };
        match self.pending.lock().remove(&correlation) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(correlation_id = %correlation, "Late or unknown reply dropped"),
        }
    }

    /// Initialize the agent under the startup timeout and open its inbox.
    async fn start_agent(&self, slot: &Arc<AgentSlot>) -> AgentState {
        let id = slot.id();
        let runtime = slot.runtime();
        let timeout = Duration::from_millis(self.config.startup_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, runtime.initialize()).await {
            Ok(Ok(())) => runtime.start_inbox(&self.bus, &agent_topic(id)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SwitchyardError::Timeout(format!(
                "initialize exceeded {}ms",
                self.config.startup_timeout_ms
            ))),
        };

        let state = slot.update(|d| {
            let next = if outcome.is_ok() {
                AgentState::Ready
            } else {
                AgentState::Failed
            };
            if let Err(e) = &outcome {
                d.last_error = Some(e.to_string());
            }
            if d.transition(next).is_ok() && next == AgentState::Ready {
                d.missed_health_checks = 0;
            }
            d.state
        });

        match (&outcome, state) {
            (Ok(()), AgentState::Ready) => info!(agent_id = %id, "Agent ready"),
            (Ok(()), other) => {
                // Deregistered while initializing.
                runtime.stop_inbox();
                debug!(agent_id = %id, state = %other, "Agent left initializing early");
            }
            (Err(e), _) => warn!(agent_id = %id, error = %e, "Agent failed to start"),
        }
        self.persist_agent(slot).await;
        state
    }

    async fn route(&self, capability: Capability, payload: Value) -> SwitchyardResult<Value> {
        let claim = match self.registry.claim(capability).await {
            Ok(claim) => claim,
            Err(e) => {
                warn!(capability = %capability, "No ready agent for capability");
                return Err(e);
            }
        };
        let agent_id = claim.slot().id();

        let request = Message::request(agent_topic(agent_id), ORCHESTRATOR_SENDER, payload)
            .with_reply_to(self.config.reply_topic.clone())
            .with_recipient(agent_topic(agent_id))
            .with_metadata("capability", json!(capability.as_str()));
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let _pending = PendingReply {
            pending: &self.pending,
            id: request_id,
        };
        debug!(agent_id = %agent_id, capability = %capability, request_id = %request_id, "Routing request");

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let result = match self.bus.publish(request) {
            Err(e) => Err(e),
            Ok(_) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => match reply.as_error() {
                    Some(err) => Err(err),
                    None => Ok(reply.payload.clone()),
                },
                Ok(Err(_)) => Err(SwitchyardError::Bus("reply channel closed".into())),
                Err(_) => Err(SwitchyardError::Timeout(format!(
                    "agent {agent_id} did not reply within {}ms",
                    self.config.request_timeout_ms
                ))),
            },
        };

        let state = match &result {
            Ok(_) => claim.finish(CallOutcome::Succeeded),
            Err(e) => {
                warn!(agent_id = %agent_id, capability = %capability, error = %e, "Routed call failed");
                claim.finish(CallOutcome::Failed(e))
            }
        };
        if state == AgentState::Failed {
            if let Some(slot) = self.registry.get(agent_id).await {
                self.persist_agent(&slot).await;
            }
        }
        result
    }

    async fn persist_agent(&self, slot: &AgentSlot) {
        if let Some(store) = &self.store {
            let descriptor = slot.descriptor();
            if let Err(e) = store.save_agent(&descriptor).await {
                warn!(agent_id = %descriptor.id, error = %e, "Failed to persist descriptor");
            }
        }
    }
}

#[async_trait]
impl CapabilityCaller for OrchestratorInner {
    async fn call(&self, capability: Capability, payload: Value) -> SwitchyardResult<Value> {
        self.route(capability, payload).await
    }

    async fn is_resolvable(&self, capability: Capability) -> bool {
        self.registry.is_resolvable(capability).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchyard_bus::BusConfig;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(&self, message: &Message) -> SwitchyardResult<Option<Value>> {
            if message.payload["fail"].as_bool() == Some(true) {
                return Err(SwitchyardError::Handler("requested failure".into()));
            }
            Ok(Some(message.payload.clone()))
        }
    }

    fn orchestrator() -> Orchestrator {
        let bus = MessageBus::new(BusConfig::default());
        bus.start().unwrap();
        Orchestrator::new(bus, OrchestratorConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_capabilities_rejected() {
        let orch = orchestrator();
        let err = orch.register(Arc::new(Echo), Vec::<Capability>::new()).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Validation(_)));
        assert!(orch.descriptors().await.is_empty());
    }

    #[tokio::test]
    async fn test_register_and_route() {
        let orch = orchestrator();
        let d = orch
            .register(Arc::new(Echo), [Capability::Summarize])
            .await
            .unwrap();
        assert_eq!(d.state, AgentState::Ready);

        let out = orch
            .route(Capability::Summarize, json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hi"}));

        let d = orch.descriptor(d.id).await.unwrap();
        assert_eq!(d.state, AgentState::Ready);
        assert_eq!(d.resource_usage.processed, 1);
        assert!(d.last_dispatched.is_some());
    }

    #[tokio::test]
    async fn test_route_without_agent() {
        let orch = orchestrator();
        let err = orch
            .route(Capability::GenerateSql, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Routing);
    }

    #[tokio::test]
    async fn test_handler_error_is_typed() {
        let orch = orchestrator();
        orch.register(Arc::new(Echo), [Capability::Summarize])
            .await
            .unwrap();
        let outcome = orch
            .submit(TaskRequest::Capability {
                capability: Capability::Summarize,
                payload: json!({"fail": true}),
            })
            .await;
        match outcome {
            TaskOutcome::Failed(failure) => {
                assert_eq!(failure.class, ErrorClass::Handler);
                assert!(failure.message.contains("requested failure"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // A handler error does not take the agent out of rotation.
        let health = orch.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.agents.get(&AgentState::Ready), Some(&1));
    }

    #[tokio::test]
    async fn test_deregister_removes_agent() {
        let orch = orchestrator();
        let d = orch
            .register(Arc::new(Echo), [Capability::Summarize])
            .await
            .unwrap();
        orch.deregister(d.id).await.unwrap();
        assert!(orch.descriptor(d.id).await.is_none());
        assert_eq!(orch.bus().subscriber_count(&agent_topic(d.id)), 0);
        assert!(orch.deregister(d.id).await.is_err());
        assert!(orch.route(Capability::Summarize, json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_cycle() {
        let orch = orchestrator();
        let d = orch
            .register(Arc::new(Echo), [Capability::Summarize])
            .await
            .unwrap();
        orch.mark_failed(d.id, "probe").await.unwrap();
        assert_eq!(orch.health().await.status, HealthStatus::Degraded);
        assert!(orch.route(Capability::Summarize, json!({})).await.is_err());

        assert_eq!(orch.restart(d.id).await.unwrap(), AgentState::Ready);
        let d = orch.descriptor(d.id).await.unwrap();
        assert_eq!(d.restart_attempts, 1);
        orch.route(Capability::Summarize, json!({})).await.unwrap();
    }
}
