pub mod supervisor;

pub use supervisor::{
    CheckKind, CheckResult, CheckSpec, HealthEvent, HealthProbe, HealthState, HealthSupervisor,
    SupervisorConfig, SupervisorStats, WorkerHealthReport,
};
