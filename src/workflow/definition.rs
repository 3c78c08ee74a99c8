use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::coordination_error::CoordinationError;
use crate::error::{Error, Result};

/// Per-step state machine: Waiting -> Running -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// How an execution walks the step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    /// Steps run in list order; unsatisfied dependencies are Skipped and a
    /// failed step aborts the rest of the run.
    Sequential,
    /// Steps run concurrently by topological generation with a hard barrier
    /// between generations.
    Parallel,
    /// Each step is gated by its condition over the run context; a false
    /// condition yields Skipped.
    Conditional,
    /// Heuristic default picking one of the above per definition shape.
    Adaptive,
}

/// Boolean gate over the accumulated run context.
///
/// A closed set of typed predicates rather than a string expression, so a
/// definition is fully validated at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Always,
    /// True when `key` exists and equals the value.
    Equals { key: String, value: serde_json::Value },
    /// True when `key` exists and is neither null nor false.
    Truthy { key: String },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    pub fn evaluate(&self, context: &serde_json::Map<String, serde_json::Value>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equals { key, value } => context.get(key) == Some(value),
            Condition::Truthy { key } => match context.get(key) {
                None | Some(serde_json::Value::Null) => false,
                Some(serde_json::Value::Bool(b)) => *b,
                Some(_) => true,
            },
            Condition::Not(inner) => !inner.evaluate(context),
            Condition::All(inner) => inner.iter().all(|c| c.evaluate(context)),
            Condition::Any(inner) => inner.iter().any(|c| c.evaluate(context)),
        }
    }
}

/// One unit of work, bound to a worker capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    /// Capability the target worker must advertise.
    pub capability: String,
    pub params: serde_json::Value,
    /// Step ids that must reach Completed before this step runs.
    pub dependencies: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Gate evaluated under the Conditional strategy.
    pub condition: Condition,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            params: serde_json::json!({}),
            dependencies: Vec::new(),
            timeout_secs: 300,
            max_retries: 3,
            condition: Condition::Always,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.dependencies.extend(ids);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }
}

/// A dependency-ordered set of steps. Validated once at registration,
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    pub strategy: ExecutionStrategy,
    /// Wall-clock budget for a whole execution.
    pub timeout_secs: u64,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: Vec::new(),
            strategy: ExecutionStrategy::Adaptive,
            timeout_secs: 3600,
        }
    }

    pub fn with_steps(mut self, steps: Vec<WorkflowStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Structural validation: step-id uniqueness, dependency referential
    /// integrity and acyclicity. All-or-nothing; a definition that fails
    /// here is never stored.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::CoordinationError(CoordinationError::InvalidWorkflow(
                    format!("duplicate step id: {}", step.id),
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::CoordinationError(CoordinationError::InvalidWorkflow(
                        format!("step {} depends on unknown step {}", step.id, dep),
                    )));
                }
                if dep == &step.id {
                    return Err(Error::CoordinationError(CoordinationError::DependencyCycle(
                        format!("step {} depends on itself", step.id),
                    )));
                }
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let generations = self.topological_generations();
        let ordered: usize = generations.iter().map(|g| g.len()).sum();
        if ordered != self.steps.len() {
            let mut on_cycle: Vec<&str> = self
                .steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !generations.iter().any(|g| g.iter().any(|s| s == id)))
                .collect();
            on_cycle.sort_unstable();
            return Err(Error::CoordinationError(CoordinationError::DependencyCycle(
                on_cycle.join(", "),
            )));
        }

        Ok(())
    }

    /// Group steps into topological generations: each generation's
    /// dependencies are fully contained in earlier generations.
    ///
    /// On a cyclic graph the cycle members are absent from the result;
    /// `validate` relies on that to detect cycles.
    pub fn topological_generations(&self) -> Vec<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for step in &self.steps {
            in_degree.insert(step.id.as_str(), step.dependencies.len());
            for dep in &step.dependencies {
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut ready: VecDeque<&str> = self
            .steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .map(|s| s.id.as_str())
            .collect();

        let mut generations = Vec::new();
        while !ready.is_empty() {
            let generation: Vec<String> = ready.iter().map(|s| s.to_string()).collect();
            let mut next = VecDeque::new();

            for step_id in ready.drain(..) {
                if let Some(children) = dependents.get(step_id) {
                    for child in children {
                        if let Some(degree) = in_degree.get_mut(child) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push_back(*child);
                            }
                        }
                    }
                }
            }

            generations.push(generation);
            ready = next;
        }

        generations
    }

    /// Share of steps carrying dependencies, used by the Adaptive strategy.
    pub fn dependency_density(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let total_deps: usize = self.steps.iter().map(|s| s.dependencies.len()).sum();
        total_deps as f64 / self.steps.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "chain").with_steps(vec![
            WorkflowStep::new("a", "build"),
            WorkflowStep::new("b", "test").depends_on(["a".to_string()]),
            WorkflowStep::new("c", "deploy").depends_on(["b".to_string()]),
        ])
    }

    #[test]
    fn test_valid_chain() {
        assert!(chain().validate().is_ok());
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let def = WorkflowDefinition::new("wf", "dup").with_steps(vec![
            WorkflowStep::new("a", "build"),
            WorkflowStep::new("a", "test"),
        ]);

        let err = def.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::CoordinationError(CoordinationError::InvalidWorkflow(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = WorkflowDefinition::new("wf", "missing")
            .with_steps(vec![WorkflowStep::new("a", "build").depends_on(["ghost".to_string()])]);

        assert!(def.validate().is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let def = WorkflowDefinition::new("wf", "cycle").with_steps(vec![
            WorkflowStep::new("a", "build").depends_on(["c".to_string()]),
            WorkflowStep::new("b", "test").depends_on(["a".to_string()]),
            WorkflowStep::new("c", "deploy").depends_on(["b".to_string()]),
        ]);

        let err = def.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::CoordinationError(CoordinationError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_generations_respect_dependencies() {
        let def = WorkflowDefinition::new("wf", "diamond").with_steps(vec![
            WorkflowStep::new("a", "build"),
            WorkflowStep::new("b", "test").depends_on(["a".to_string()]),
            WorkflowStep::new("c", "lint").depends_on(["a".to_string()]),
            WorkflowStep::new("d", "deploy").depends_on(["b".to_string(), "c".to_string()]),
        ]);

        let generations = def.topological_generations();
        assert_eq!(generations.len(), 3);
        assert_eq!(generations[0], vec!["a"]);
        let mut middle = generations[1].clone();
        middle.sort();
        assert_eq!(middle, vec!["b", "c"]);
        assert_eq!(generations[2], vec!["d"]);
    }

    #[test]
    fn test_condition_evaluation() {
        let mut context = serde_json::Map::new();
        context.insert("built".into(), serde_json::json!(true));
        context.insert("target".into(), serde_json::json!("linux"));

        assert!(Condition::Truthy { key: "built".into() }.evaluate(&context));
        assert!(!Condition::Truthy { key: "missing".into() }.evaluate(&context));
        assert!(
            Condition::Equals { key: "target".into(), value: serde_json::json!("linux") }
                .evaluate(&context)
        );
        assert!(
            Condition::All(vec![
                Condition::Truthy { key: "built".into() },
                Condition::Not(Box::new(Condition::Truthy { key: "failed".into() })),
            ])
            .evaluate(&context)
        );
    }
}
