pub mod context;
pub mod telemetry;

pub use context::{CoordinationContext, CoordinatorConfig, RuntimeInfo};
