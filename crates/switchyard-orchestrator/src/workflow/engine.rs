use super::definition::{resolve_inputs, WorkflowDefinition, WorkflowGraph};
use super::execution::{ExecutionStatus, StepStatus, WorkflowExecution};
use crate::store::StateStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchyard_core::{Capability, RetryPolicy, SwitchyardError, SwitchyardResult};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How the engine reaches agents. Implemented by the orchestrator; tests
/// substitute mocks.
#[async_trait]
pub trait CapabilityCaller: Send + Sync {
    /// Run one capability call to completion.
    async fn call(&self, capability: Capability, payload: Value) -> SwitchyardResult<Value>;

    /// Whether some agent could currently serve `capability`.
    async fn is_resolvable(&self, capability: Capability) -> bool;
}

struct ExecutionHandle {
    state: Mutex<WorkflowExecution>,
    cancel: AtomicBool,
    done: watch::Sender<bool>,
}

impl ExecutionHandle {
    fn snapshot(&self) -> WorkflowExecution {
        self.state.lock().clone()
    }
}

/// Runs workflow definitions against a [`CapabilityCaller`].
#[derive(Clone)]
pub struct WorkflowEngine {
    caller: Arc<dyn CapabilityCaller>,
    store: Option<Arc<dyn StateStore>>,
    executions: Arc<RwLock<HashMap<Uuid, Arc<ExecutionHandle>>>>,
}

type StepResult = (usize, u32, SwitchyardResult<Value>);

impl WorkflowEngine {
    pub fn new(caller: Arc<dyn CapabilityCaller>) -> Self {
        Self {
            caller,
            store: None,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Persist every execution status change to `store`.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate `definition` and run it in the background. Returns the
    /// execution id for polling.
    pub async fn start(&self, definition: WorkflowDefinition, input: Value) -> SwitchyardResult<Uuid> {
        let graph = Arc::new(definition.compile()?);
        let handle = self.register(definition, input).await;
        let id = handle.snapshot().id;
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(handle, graph).await;
        });
        Ok(id)
    }

    /// Validate and run `definition` to completion.
    pub async fn execute(
        &self,
        definition: WorkflowDefinition,
        input: Value,
    ) -> SwitchyardResult<WorkflowExecution> {
        let graph = Arc::new(definition.compile()?);
        let handle = self.register(definition, input).await;
        self.run(Arc::clone(&handle), graph).await;
        Ok(handle.snapshot())
    }

    /// Request cooperative cancellation. Steps already dispatched finish;
    /// no further step starts.
    pub fn cancel(&self, id: Uuid) -> SwitchyardResult<()> {
        let handle = self
            .executions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SwitchyardError::NotFound(format!("execution {id}")))?;
        handle.cancel.store(true, Ordering::SeqCst);
        info!(execution_id = %id, "Cancellation requested");
        Ok(())
    }

    pub fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.executions.read().get(&id).map(|h| h.snapshot())
    }

    /// All known executions, oldest first.
    pub fn executions(&self) -> Vec<WorkflowExecution> {
        let mut all: Vec<_> = self
            .executions
            .read()
            .values()
            .map(|h| h.snapshot())
            .collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    /// Wait until execution `id` reaches a terminal status.
    pub async fn wait(&self, id: Uuid) -> SwitchyardResult<WorkflowExecution> {
        let handle = self
            .executions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SwitchyardError::NotFound(format!("execution {id}")))?;
        let mut done = handle.done.subscribe();
        done.wait_for(|finished| *finished)
            .await
            .map_err(|_| SwitchyardError::Workflow(format!("execution {id} was dropped")))?;
        Ok(handle.snapshot())
    }

    /// Load persisted executions. Ones that were still in progress cannot be
    /// resumed and are marked failed.
    pub async fn recover(&self) -> SwitchyardResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut recovered = 0;
        for mut execution in store.list_executions().await? {
            if !execution.status.is_terminal() {
                execution.finish(ExecutionStatus::Failed {
                    reason: "interrupted before completion".into(),
                });
                store.save_execution(&execution).await?;
            }
            let (done, _) = watch::channel(true);
            let handle = Arc::new(ExecutionHandle {
                state: Mutex::new(execution),
                cancel: AtomicBool::new(false),
                done,
            });
            let id = handle.snapshot().id;
            self.executions.write().insert(id, handle);
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn register(&self, definition: WorkflowDefinition, input: Value) -> Arc<ExecutionHandle> {
        let execution = WorkflowExecution::new(definition, input);
        let id = execution.id;
        let (done, _) = watch::channel(false);
        let handle = Arc::new(ExecutionHandle {
            state: Mutex::new(execution),
            cancel: AtomicBool::new(false),
            done,
        });
        self.executions.write().insert(id, Arc::clone(&handle));
        self.persist(&handle).await;
        handle
    }

    async fn persist(&self, handle: &ExecutionHandle) {
        if let Some(store) = &self.store {
            let snapshot = handle.snapshot();
            if let Err(e) = store.save_execution(&snapshot).await {
                warn!(execution_id = %snapshot.id, error = %e, "Failed to persist execution");
            }
        }
    }

    async fn set_status(&self, handle: &ExecutionHandle, status: ExecutionStatus) {
        let changed = {
            let mut exec = handle.state.lock();
            if exec.status == status {
                false
            } else {
                if status == ExecutionStatus::Running && exec.started_at.is_none() {
                    exec.started_at = Some(chrono::Utc::now());
                }
                exec.status = status;
                true
            }
        };
        if changed {
            self.persist(handle).await;
        }
    }

    async fn run(&self, handle: Arc<ExecutionHandle>, graph: Arc<WorkflowGraph>) {
        let id = handle.snapshot().id;
        info!(execution_id = %id, workflow = %graph.name(), steps = graph.len(), "Workflow started");

        let mut missing = Vec::new();
        for capability in graph.capabilities() {
            if !self.caller.is_resolvable(capability).await {
                missing.push(capability.as_str());
            }
        }
        if !missing.is_empty() {
            let reason = format!("no capable agent for: {}", missing.join(", "));
            warn!(execution_id = %id, reason = %reason, "Workflow cannot start");
            self.finish(&handle, ExecutionStatus::Failed { reason }).await;
            return;
        }

        self.set_status(&handle, ExecutionStatus::Running).await;

        let n = graph.len();
        let mut status = vec![StepStatus::Pending; n];
        let mut tasks: JoinSet<StepResult> = JoinSet::new();
        let mut failure: Option<String> = None;
        let mut cancelled = false;

        loop {
            if failure.is_none() && !cancelled {
                cancelled = self.dispatch_ready(&handle, &graph, &mut status, &mut tasks, &mut failure);
            }
            if tasks.is_empty() {
                break;
            }

            self.set_status(&handle, ExecutionStatus::AwaitingStep).await;
            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok((i, attempts, Ok(output))) => {
                    status[i] = StepStatus::Succeeded;
                    let step_id = &graph.node(i).step.id;
                    handle.state.lock().mark_succeeded(step_id, attempts, output);
                    info!(execution_id = %id, step = %step_id, attempts, "Step succeeded");
                }
                Ok((i, attempts, Err(e))) => {
                    status[i] = StepStatus::Failed;
                    let step_id = &graph.node(i).step.id;
                    handle.state.lock().mark_failed(step_id, attempts, e.to_string());
                    warn!(execution_id = %id, step = %step_id, attempts, error = %e, "Step failed");
                    failure.get_or_insert_with(|| {
                        format!("step '{step_id}' failed after {attempts} attempt(s): {e}")
                    });
                }
                Err(join_err) => {
                    error!(execution_id = %id, error = %join_err, "Step task aborted");
                    failure.get_or_insert_with(|| format!("step task aborted: {join_err}"));
                }
            }
            self.set_status(&handle, ExecutionStatus::Running).await;
        }

        let final_status = if let Some(reason) = failure {
            self.compensate(&handle, &graph).await;
            ExecutionStatus::Failed { reason }
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Succeeded
        };
        self.finish(&handle, final_status).await;
    }

    /// Start every step whose dependencies are settled, in definition order.
    /// Returns `true` when cancellation stopped dispatch.
    fn dispatch_ready(
        &self,
        handle: &ExecutionHandle,
        graph: &WorkflowGraph,
        status: &mut [StepStatus],
        tasks: &mut JoinSet<StepResult>,
        failure: &mut Option<String>,
    ) -> bool {
        // Skips can make further steps ready, so sweep until nothing changes.
        let mut progressed = true;
        while progressed {
            progressed = false;
            for i in 0..graph.len() {
                if status[i] != StepStatus::Pending {
                    continue;
                }
                let node = graph.node(i);
                let deps: Vec<StepStatus> = node.deps.iter().map(|&d| status[d]).collect();
                if !deps
                    .iter()
                    .all(|s| matches!(s, StepStatus::Succeeded | StepStatus::Skipped))
                {
                    continue;
                }

                let context = handle.state.lock().context.clone();
                let branch_skipped = deps.contains(&StepStatus::Skipped);
                let condition_unmet = node
                    .step
                    .condition
                    .as_ref()
                    .is_some_and(|c| !c.evaluate(&context));
                if branch_skipped || condition_unmet {
                    status[i] = StepStatus::Skipped;
                    handle.state.lock().mark_skipped(&node.step.id);
                    info!(step = %node.step.id, "Step skipped");
                    progressed = true;
                    continue;
                }

                if handle.cancel.load(Ordering::SeqCst) {
                    info!(step = %node.step.id, "Cancelled before dispatch");
                    return true;
                }

                let payload = match resolve_inputs(&node.step.input, &context) {
                    Ok(payload) => payload,
                    Err(e) => {
                        status[i] = StepStatus::Failed;
                        handle.state.lock().mark_failed(&node.step.id, 0, e.to_string());
                        *failure = Some(format!("step '{}' input: {e}", node.step.id));
                        return false;
                    }
                };

                status[i] = StepStatus::Running;
                handle.state.lock().mark_running(&node.step.id);
                tasks.spawn(run_step(
                    Arc::clone(&self.caller),
                    i,
                    node.step.capability,
                    payload,
                    node.step.retry.clone(),
                ));
                progressed = true;
            }
        }
        false
    }

    /// Run compensations of succeeded steps once each, newest first.
    async fn compensate(&self, handle: &ExecutionHandle, graph: &WorkflowGraph) {
        let (order, context) = {
            let exec = handle.state.lock();
            (exec.completed_order.clone(), exec.context.clone())
        };
        for step_id in order.iter().rev() {
            let Some(i) = graph.index_of(step_id) else {
                continue;
            };
            let Some(comp) = &graph.node(i).step.compensation else {
                continue;
            };
            let result = match resolve_inputs(&comp.input, &context) {
                Ok(payload) => self.caller.call(comp.capability, payload).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    if let Some(rec) = handle.state.lock().step_mut(step_id) {
                        rec.compensated = true;
                    }
                    info!(step = %step_id, "Compensation applied");
                }
                Err(e) => warn!(step = %step_id, error = %e, "Compensation failed"),
            }
        }
    }

    async fn finish(&self, handle: &ExecutionHandle, status: ExecutionStatus) {
        let id = {
            let mut exec = handle.state.lock();
            exec.finish(status.clone());
            exec.id
        };
        self.persist(handle).await;
        handle.done.send_replace(true);
        match &status {
            ExecutionStatus::Failed { reason } => {
                warn!(execution_id = %id, reason = %reason, "Workflow failed");
            }
            _ => info!(execution_id = %id, status = ?status, "Workflow finished"),
        }
    }
}

async fn run_step(
    caller: Arc<dyn CapabilityCaller>,
    index: usize,
    capability: Capability,
    payload: Value,
    retry: RetryPolicy,
) -> StepResult {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match caller.call(capability, payload.clone()).await {
            Ok(output) => return (index, attempts, Ok(output)),
            Err(e) if retry.allows_another(attempts) => {
                let delay = retry.backoff(attempts - 1);
                warn!(capability = %capability, attempt = attempts, error = %e, delay_ms = delay.as_millis() as u64, "Step attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (index, attempts, Err(e)),
        }
    }
}
