use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::communication::{CommunicationRouter, MessagePriority, Reply};
use crate::error::coordination_error::CoordinationError;
use crate::error::{Error, Result};
use crate::registry::{FindCriteria, ServiceRegistry};
use crate::workflow::definition::{
    ExecutionStrategy, StepStatus, WorkflowDefinition, WorkflowStep,
};

/// Sender id the engine dispatches under.
const ENGINE_ID: &str = "workflow-engine";

/// Whole-execution state machine: Pending -> Running -> terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// A bound instance of a definition plus its input data.
///
/// Owned exclusively by the engine until terminal, then moved into the
/// capped history buffer.
#[derive(Debug, Clone)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub step_status: HashMap<String, StepStatus>,
    pub step_errors: HashMap<String, String>,
    /// Accumulated run context: input keys plus one entry per completed
    /// step, keyed by step id.
    pub context: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deadline: DateTime<Utc>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .step_status
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub history_capacity: usize,
    pub sweep_interval_secs: u64,
    /// Fixed backoff between step retry attempts.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            sweep_interval_secs: 1,
            retry_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct EngineCounters {
    total_executions: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    steps_executed: u64,
}

/// Executes dependency graphs of steps across the fleet.
///
/// The only place the engine touches the other components is step dispatch:
/// `Registry::find_best` for worker selection, `Router::request` for delivery.
pub struct WorkflowEngine {
    registry: Arc<ServiceRegistry>,
    router: Arc<CommunicationRouter>,
    workflows: Arc<RwLock<HashMap<String, WorkflowDefinition>>>,
    executions: Arc<RwLock<HashMap<Uuid, WorkflowExecution>>>,
    history: Arc<RwLock<VecDeque<WorkflowExecution>>>,
    running: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
    counters: Arc<RwLock<EngineCounters>>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        router: Arc<CommunicationRouter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            router,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            executions: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            running: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(EngineCounters::default())),
            config,
        }
    }

    /// Validate and store a definition. All-or-nothing: a rejected
    /// definition is never partially stored.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;

        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&definition.id) {
            return Err(Error::CoordinationError(CoordinationError::InvalidWorkflow(
                format!("workflow id already registered: {}", definition.id),
            )));
        }

        info!("workflow {} registered ({} steps)", definition.id, definition.steps.len());
        workflows.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        self.workflows.read().await.values().cloned().collect()
    }

    /// Start an execution of a registered workflow. Returns the execution id
    /// immediately; progress is observed through [`get_execution`].
    ///
    /// An object `input` seeds the run context so conditions can gate on it.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid> {
        let definition = self
            .workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| {
                Error::CoordinationError(CoordinationError::WorkflowNotFound(
                    workflow_id.to_string(),
                ))
            })?;

        let execution_id = Uuid::new_v4();
        let now = Utc::now();

        let mut context = serde_json::Map::new();
        if let serde_json::Value::Object(map) = input {
            context.extend(map);
        }

        let execution = WorkflowExecution {
            execution_id,
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Pending,
            step_status: definition
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepStatus::Waiting))
                .collect(),
            step_errors: HashMap::new(),
            context,
            started_at: now,
            finished_at: None,
            deadline: now + chrono::Duration::seconds(definition.timeout_secs as i64),
            completed_steps: 0,
            total_steps: definition.steps.len(),
            error: None,
        };

        self.executions.write().await.insert(execution_id, execution);
        self.counters.write().await.total_executions += 1;

        // Hold the lock across spawn + insert so the task's own finalize
        // (which removes the entry) cannot run before the handle is stored.
        let engine = self.clone();
        let mut running = self.running.write().await;
        let handle = tokio::spawn(async move {
            engine.run_execution(definition, execution_id).await;
        });
        running.insert(execution_id, handle);
        drop(running);

        info!("execution {} of workflow {} started", execution_id, workflow_id);
        Ok(execution_id)
    }

    /// Snapshot of a live or historical execution.
    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        if let Some(execution) = self.executions.read().await.get(&execution_id) {
            return Some(execution.clone());
        }
        self.history
            .read()
            .await
            .iter()
            .find(|e| e.execution_id == execution_id)
            .cloned()
    }

    /// Terminal executions, most recent last.
    pub async fn execution_history(&self) -> Vec<WorkflowExecution> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Cancel a live execution: terminal status is set and the underlying
    /// task aborted. In-flight step sends are abandoned, not revoked.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        let live = self
            .executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| !e.status.is_terminal())
            .unwrap_or(false);
        if !live {
            return false;
        }

        if let Some(handle) = self.running.write().await.remove(&execution_id) {
            handle.abort();
        }
        self.finalize(execution_id, ExecutionStatus::Cancelled, Some("cancelled".into()))
            .await;
        true
    }

    /// Background sweep that times out over-budget executions, discarding
    /// their in-flight step results.
    pub fn start_timeout_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval_secs;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let now = Utc::now();

                let overdue: Vec<Uuid> = self
                    .executions
                    .read()
                    .await
                    .values()
                    .filter(|e| !e.status.is_terminal() && now > e.deadline)
                    .map(|e| e.execution_id)
                    .collect();

                for execution_id in overdue {
                    warn!("execution {} exceeded its wall-clock budget", execution_id);
                    if let Some(handle) = self.running.write().await.remove(&execution_id) {
                        handle.abort();
                    }
                    self.finalize(
                        execution_id,
                        ExecutionStatus::Timeout,
                        Some("wall-clock budget exceeded".into()),
                    )
                    .await;
                }
            }
        })
    }

    pub async fn get_stats(&self) -> EngineStats {
        let counters = self.counters.read().await.clone();
        EngineStats {
            registered_workflows: self.workflows.read().await.len(),
            active_executions: self.running.read().await.len(),
            total_executions: counters.total_executions,
            succeeded: counters.succeeded,
            failed: counters.failed,
            cancelled: counters.cancelled,
            timed_out: counters.timed_out,
            steps_executed: counters.steps_executed,
        }
    }

    async fn run_execution(self: Arc<Self>, definition: WorkflowDefinition, execution_id: Uuid) {
        self.set_execution_status(execution_id, ExecutionStatus::Running).await;

        let strategy = match definition.strategy {
            ExecutionStrategy::Adaptive => Self::pick_strategy(&definition),
            other => other,
        };
        debug!("execution {} running under {:?}", execution_id, strategy);

        match strategy {
            ExecutionStrategy::Sequential => self.run_sequential(&definition, execution_id).await,
            ExecutionStrategy::Parallel => self.run_parallel(&definition, execution_id).await,
            ExecutionStrategy::Conditional => self.run_conditional(&definition, execution_id).await,
            ExecutionStrategy::Adaptive => unreachable!("adaptive resolved above"),
        }

        // Cancellation/timeout finalize elsewhere and abort this task, so
        // reaching this point means the run itself finished.
        let failed = self
            .executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.step_status.values().any(|s| *s == StepStatus::Failed))
            .unwrap_or(false);

        let (status, error) = if failed {
            (ExecutionStatus::Failed, Some("one or more steps failed".to_string()))
        } else {
            (ExecutionStatus::Completed, None)
        };
        self.finalize(execution_id, status, error).await;
    }

    /// Default heuristic: small runs stay Sequential, dependency-dense runs
    /// go Parallel, the rest Conditional. A policy default, not a guarantee.
    fn pick_strategy(definition: &WorkflowDefinition) -> ExecutionStrategy {
        if definition.steps.len() <= 3 {
            ExecutionStrategy::Sequential
        } else if definition.dependency_density() > 0.5 {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Conditional
        }
    }

    /// List order; unsatisfied dependencies skip, a failed step aborts the
    /// remaining run.
    async fn run_sequential(&self, definition: &WorkflowDefinition, execution_id: Uuid) {
        for step in &definition.steps {
            if !self.dependencies_satisfied(execution_id, step).await {
                self.set_step_status(execution_id, &step.id, StepStatus::Skipped).await;
                continue;
            }

            let outcome = self.run_step(execution_id, step).await;
            if outcome == StepStatus::Failed {
                warn!("execution {} aborted at step {}", execution_id, step.id);
                break;
            }
        }
    }

    /// Topological generations with a hard barrier: a dependent step never
    /// starts before every dependency is terminal.
    async fn run_parallel(&self, definition: &WorkflowDefinition, execution_id: Uuid) {
        for generation in definition.topological_generations() {
            let mut runnable = Vec::new();

            for step_id in &generation {
                let Some(step) = definition.step(step_id) else {
                    continue;
                };
                if self.dependencies_satisfied(execution_id, step).await {
                    runnable.push(step);
                } else {
                    self.set_step_status(execution_id, step_id, StepStatus::Skipped).await;
                }
            }

            // Generation barrier.
            join_all(runnable.into_iter().map(|step| self.run_step(execution_id, step))).await;
        }
    }

    /// Condition-gated list order; a false gate skips without failing the run.
    async fn run_conditional(&self, definition: &WorkflowDefinition, execution_id: Uuid) {
        for step in &definition.steps {
            if !self.dependencies_satisfied(execution_id, step).await {
                self.set_step_status(execution_id, &step.id, StepStatus::Skipped).await;
                continue;
            }

            let context = self.context_snapshot(execution_id).await;
            if !step.condition.evaluate(&context) {
                debug!("step {} gated off by condition", step.id);
                self.set_step_status(execution_id, &step.id, StepStatus::Skipped).await;
                continue;
            }

            self.run_step(execution_id, step).await;
        }
    }

    /// Dispatch one step: resolve the target through the registry, send the
    /// request through the router, retry on failure with fixed backoff.
    async fn run_step(&self, execution_id: Uuid, step: &WorkflowStep) -> StepStatus {
        self.set_step_status(execution_id, &step.id, StepStatus::Running).await;

        let mut last_error = String::new();
        let attempts = step.max_retries + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.retry_backoff_ms))
                    .await;
                debug!("step {} retry {}/{}", step.id, attempt, step.max_retries);
            }

            match self.dispatch_step(step).await {
                Ok(result) => {
                    self.record_step_result(execution_id, &step.id, result).await;
                    self.counters.write().await.steps_executed += 1;
                    return StepStatus::Completed;
                }
                Err(e) => last_error = e,
            }
        }

        warn!("step {} failed after {} attempts: {}", step.id, attempts, last_error);
        self.record_step_failure(execution_id, &step.id, last_error).await;
        self.counters.write().await.steps_executed += 1;
        StepStatus::Failed
    }

    async fn dispatch_step(&self, step: &WorkflowStep) -> std::result::Result<serde_json::Value, String> {
        let criteria = FindCriteria::capability(&step.capability);
        let Some(worker) = self.registry.find_best(&criteria).await else {
            return Err(
                CoordinationError::NoWorkerAvailable(step.capability.clone()).to_string(),
            );
        };

        let started = std::time::Instant::now();
        let reply = self
            .router
            .request(
                ENGINE_ID,
                &worker.id,
                &step.capability,
                step.params.clone(),
                MessagePriority::Normal,
                Some(step.timeout_secs),
            )
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match reply {
            Ok(Reply::Success(value)) => {
                self.registry.record_request_outcome(&worker.id, true, elapsed).await;
                Ok(value)
            }
            Ok(Reply::Failure(error)) => {
                self.registry.record_request_outcome(&worker.id, false, elapsed).await;
                Err(error.to_string())
            }
            Err(e) => {
                self.registry.record_request_outcome(&worker.id, false, elapsed).await;
                Err(e.to_string())
            }
        }
    }

    /// A step may run only when every dependency reached Completed.
    async fn dependencies_satisfied(&self, execution_id: Uuid, step: &WorkflowStep) -> bool {
        if step.dependencies.is_empty() {
            return true;
        }

        let executions = self.executions.read().await;
        let Some(execution) = executions.get(&execution_id) else {
            return false;
        };
        step.dependencies
            .iter()
            .all(|dep| execution.step_status.get(dep) == Some(&StepStatus::Completed))
    }

    async fn set_execution_status(&self, execution_id: Uuid, status: ExecutionStatus) {
        let mut executions = self.executions.write().await;
        if let Some(execution) = executions.get_mut(&execution_id)
            && !execution.status.is_terminal()
        {
            execution.status = status;
        }
    }

    async fn set_step_status(&self, execution_id: Uuid, step_id: &str, status: StepStatus) {
        let mut executions = self.executions.write().await;
        if let Some(execution) = executions.get_mut(&execution_id)
            && let Some(current) = execution.step_status.get_mut(step_id)
            && !current.is_terminal()
        {
            *current = status;
        }
    }

    async fn record_step_result(
        &self,
        execution_id: Uuid,
        step_id: &str,
        result: serde_json::Value,
    ) {
        let mut executions = self.executions.write().await;
        if let Some(execution) = executions.get_mut(&execution_id) {
            if let Some(current) = execution.step_status.get_mut(step_id)
                && !current.is_terminal()
            {
                *current = StepStatus::Completed;
            }
            execution.context.insert(step_id.to_string(), result);
            execution.completed_steps += 1;
        }
    }

    async fn record_step_failure(&self, execution_id: Uuid, step_id: &str, error: String) {
        let mut executions = self.executions.write().await;
        if let Some(execution) = executions.get_mut(&execution_id) {
            if let Some(current) = execution.step_status.get_mut(step_id)
                && !current.is_terminal()
            {
                *current = StepStatus::Failed;
            }
            execution.step_errors.insert(step_id.to_string(), error);
        }
    }

    async fn context_snapshot(
        &self,
        execution_id: Uuid,
    ) -> serde_json::Map<String, serde_json::Value> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .map(|e| e.context.clone())
            .unwrap_or_default()
    }

    /// Move an execution into the capped history buffer with its terminal
    /// status and drop its run handle. Idempotent: a second finalize finds
    /// nothing to move.
    async fn finalize(&self, execution_id: Uuid, status: ExecutionStatus, error: Option<String>) {
        self.running.write().await.remove(&execution_id);
        let Some(mut execution) = self.executions.write().await.remove(&execution_id) else {
            return;
        };

        execution.status = status;
        execution.finished_at = Some(Utc::now());
        if execution.error.is_none() {
            execution.error = error;
        }

        {
            let mut counters = self.counters.write().await;
            match status {
                ExecutionStatus::Completed => counters.succeeded += 1,
                ExecutionStatus::Failed => counters.failed += 1,
                ExecutionStatus::Cancelled => counters.cancelled += 1,
                ExecutionStatus::Timeout => counters.timed_out += 1,
                _ => {}
            }
        }

        info!("execution {} finished: {:?}", execution_id, status);

        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(execution);
    }
}

/// Engine statistics for the monitoring surface.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub registered_workflows: usize,
    pub active_executions: usize,
    pub total_executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub steps_executed: u64,
}
