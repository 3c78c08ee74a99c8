pub mod communication;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod registry;
pub mod shared;
pub mod workflow;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
