use super::definition::WorkflowDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Status of a workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// At least one step's capability call is outstanding.
    AwaitingStep,
    Succeeded,
    Failed {
        reason: String,
    },
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed { .. } | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Compensation ran successfully for this step.
    #[serde(default)]
    pub compensated: bool,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            compensated: false,
        }
    }
}

/// A single run of a [`WorkflowDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow: String,
    pub definition: WorkflowDefinition,
    pub status: ExecutionStatus,
    /// Steps whose capability call is outstanding.
    #[serde(default)]
    pub active_steps: Vec<String>,
    pub steps: BTreeMap<String, StepRecord>,
    /// Succeeded step ids in completion order.
    #[serde(default)]
    pub completed_order: Vec<String>,
    /// `{"input": ..., "steps": {id: output}}`
    pub context: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(definition: WorkflowDefinition, input: Value) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::pending()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            workflow: definition.name.clone(),
            definition,
            status: ExecutionStatus::Pending,
            active_steps: Vec::new(),
            steps,
            completed_order: Vec::new(),
            context: json!({ "input": input, "steps": {} }),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub(crate) fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.get_mut(id)
    }

    pub(crate) fn mark_running(&mut self, id: &str) {
        if let Some(rec) = self.steps.get_mut(id) {
            rec.status = StepStatus::Running;
            rec.started_at = Some(Utc::now());
        }
        self.active_steps.push(id.to_string());
    }

    pub(crate) fn mark_skipped(&mut self, id: &str) {
        if let Some(rec) = self.steps.get_mut(id) {
            rec.status = StepStatus::Skipped;
            rec.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn mark_succeeded(&mut self, id: &str, attempts: u32, output: Value) {
        self.active_steps.retain(|s| s != id);
        if let Some(steps) = self.context["steps"].as_object_mut() {
            steps.insert(id.to_string(), output.clone());
        }
        if let Some(rec) = self.steps.get_mut(id) {
            rec.status = StepStatus::Succeeded;
            rec.attempts = attempts;
            rec.output = Some(output);
            rec.finished_at = Some(Utc::now());
        }
        self.completed_order.push(id.to_string());
    }

    pub(crate) fn mark_failed(&mut self, id: &str, attempts: u32, error: String) {
        self.active_steps.retain(|s| s != id);
        if let Some(rec) = self.steps.get_mut(id) {
            rec.status = StepStatus::Failed;
            rec.attempts = attempts;
            rec.error = Some(error);
            rec.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.active_steps.clear();
        self.finished_at = Some(Utc::now());
    }
}
