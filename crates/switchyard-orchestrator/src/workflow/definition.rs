use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use switchyard_core::{Capability, RetryPolicy, SwitchyardError, SwitchyardResult};

/// Where a step input value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ValueSource {
    /// A fixed value.
    Literal { value: Value },
    /// JSON pointer into the workflow input (`""` for the whole input).
    Input {
        #[serde(default)]
        pointer: String,
    },
    /// JSON pointer into an earlier step's output.
    Step {
        step: String,
        #[serde(default)]
        pointer: String,
    },
}

impl ValueSource {
    /// Resolve against an execution context of shape
    /// `{"input": ..., "steps": {id: output}}`.
    pub fn resolve(&self, context: &Value) -> SwitchyardResult<Value> {
        match self {
            ValueSource::Literal { value } => Ok(value.clone()),
            ValueSource::Input { pointer } => context["input"]
                .pointer(pointer)
                .cloned()
                .ok_or_else(|| {
                    SwitchyardError::Workflow(format!("input has no value at '{pointer}'"))
                }),
            ValueSource::Step { step, pointer } => {
                let output = context["steps"].get(step).ok_or_else(|| {
                    SwitchyardError::Workflow(format!("step '{step}' has no output"))
                })?;
                output.pointer(pointer).cloned().ok_or_else(|| {
                    SwitchyardError::Workflow(format!(
                        "output of step '{step}' has no value at '{pointer}'"
                    ))
                })
            }
        }
    }
}

/// Build a step payload object from its input sources.
pub fn resolve_inputs(
    inputs: &BTreeMap<String, ValueSource>,
    context: &Value,
) -> SwitchyardResult<Value> {
    let mut payload = serde_json::Map::new();
    for (key, source) in inputs {
        payload.insert(key.clone(), source.resolve(context)?);
    }
    Ok(Value::Object(payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Exists,
    Truthy,
}

/// Predicate over the accumulated context that gates a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// JSON pointer into the context, e.g. `/steps/validate/valid`.
    pub path: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn evaluate(&self, context: &Value) -> bool {
        let actual = context.pointer(&self.path);
        match self.op {
            ConditionOp::Exists => actual.is_some_and(|v| !v.is_null()),
            ConditionOp::Truthy => actual.is_some_and(truthy),
            ConditionOp::Eq => actual == Some(&self.value),
            ConditionOp::Ne => actual != Some(&self.value),
            ConditionOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            ConditionOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Undo action run when the workflow fails after this step succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub capability: Capability,
    #[serde(default)]
    pub input: BTreeMap<String, ValueSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub capability: Capability,
    #[serde(default)]
    pub input: BTreeMap<String, ValueSource>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub compensation: Option<Compensation>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            capability,
            input: BTreeMap::new(),
            depends_on: Vec::new(),
            condition: None,
            retry: RetryPolicy::none(),
            compensation: None,
        }
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, source: ValueSource) -> Self {
        self.input.insert(key.into(), source);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compensation(mut self, compensation: Compensation) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Every step this one must wait for: `depends_on` plus the steps its
    /// inputs, compensation inputs and condition read from.
    pub fn referenced_steps(&self) -> Vec<String> {
        let compensation_inputs = self.compensation.iter().flat_map(|c| c.input.values());
        let from_inputs = self
            .input
            .values()
            .chain(compensation_inputs)
            .filter_map(|source| match source {
                ValueSource::Step { step, .. } => Some(step.clone()),
                _ => None,
            });
        let from_condition = self
            .condition
            .as_ref()
            .and_then(|c| condition_step(&c.path));
        self.depends_on
            .iter()
            .cloned()
            .chain(from_inputs)
            .chain(from_condition)
            .collect()
    }
}

/// Step id named by a `/steps/<id>/...` context pointer.
fn condition_step(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/steps/")?;
    let token = rest.split('/').next().filter(|t| !t.is_empty())?;
    Some(token.replace("~1", "/").replace("~0", "~"))
}

/// A declarative multi-step workflow, as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

/// One compiled step: its definition plus index-based edges.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub step: StepDefinition,
    pub deps: Vec<usize>,
    pub dependents: Vec<usize>,
}

/// Validated, acyclic step graph. Nodes keep definition order.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    /// Validate and build the index-based graph.
    pub fn compile(&self) -> SwitchyardResult<WorkflowGraph> {
        if self.steps.is_empty() {
            return Err(SwitchyardError::Workflow(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(SwitchyardError::Workflow("step id must not be empty".into()));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(SwitchyardError::Workflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut nodes: Vec<StepNode> = self
            .steps
            .iter()
            .map(|step| StepNode {
                step: step.clone(),
                deps: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (i, step) in self.steps.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dep in step.referenced_steps() {
                let &j = index.get(dep.as_str()).ok_or_else(|| {
                    SwitchyardError::Workflow(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.id
                    ))
                })?;
                if seen.insert(j) {
                    nodes[i].deps.push(j);
                    nodes[j].dependents.push(i);
                }
            }
        }

        let graph = WorkflowGraph {
            name: self.name.clone(),
            nodes,
            index,
        };
        if let Some(step) = graph.find_cycle() {
            return Err(SwitchyardError::Workflow(format!(
                "dependency cycle through step '{step}'"
            )));
        }
        Ok(graph)
    }
}

impl WorkflowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, i: usize) -> &StepNode {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Every capability a run of this graph may call, compensations included.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::new();
        for node in &self.nodes {
            caps.insert(node.step.capability);
            if let Some(comp) = &node.step.compensation {
                caps.insert(comp.capability);
            }
        }
        caps
    }

    fn find_cycle(&self) -> Option<&str> {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks = vec![0u8; self.nodes.len()];
        (0..self.nodes.len())
            .find(|&i| self.dfs_cycle(i, &mut marks))
            .map(|i| self.nodes[i].step.id.as_str())
    }

    fn dfs_cycle(&self, i: usize, marks: &mut [u8]) -> bool {
        match marks[i] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        marks[i] = 1;
        for &dep in &self.nodes[i].deps {
            if self.dfs_cycle(dep, marks) {
                return true;
            }
        }
        marks[i] = 2;
        false
    }
}
