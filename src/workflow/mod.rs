pub mod definition;
pub mod engine;

pub use definition::{
    Condition, ExecutionStrategy, StepStatus, WorkflowDefinition, WorkflowStep,
};
pub use engine::{
    EngineConfig, EngineStats, ExecutionStatus, WorkflowEngine, WorkflowExecution,
};
