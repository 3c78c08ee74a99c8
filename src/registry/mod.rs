pub mod service_registry;
pub mod types;

pub use service_registry::{
    FindCriteria, RegistryConfig, RegistryEvent, RegistryStats, ServiceRegistry, WorkerProbe,
};
pub use types::{
    Capability, HealthSnapshot, WorkerMetrics, WorkerRegistration, WorkerSpec, WorkerStatus,
};
