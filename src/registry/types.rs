use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle status.
///
/// Mutated only through registry/supervisor methods, never externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    Initializing,
    Active,
    Inactive,
    Error,
    ShuttingDown,
    Shutdown,
}

/// A named, versioned unit of functionality a worker advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub operations: Vec<String>,
    pub version: String,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
            version: "1.0".to_string(),
        }
    }

    pub fn with_operations(mut self, operations: Vec<String>) -> Self {
        self.operations = operations;
        self
    }
}

/// Latest probe outcome for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub is_healthy: bool,
    /// Last probe response time in seconds.
    pub response_time: f64,
    pub last_check: DateTime<Utc>,
    pub check_count: u64,
    pub consecutive_failures: u32,
}

impl HealthSnapshot {
    pub fn initial() -> Self {
        Self {
            is_healthy: true,
            response_time: 0.0,
            last_check: Utc::now(),
            check_count: 0,
            consecutive_failures: 0,
        }
    }
}

/// Per-worker request counters, refreshed on heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub requests_processed: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Everything the registry knows about one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    pub name: String,
    pub role: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub registration_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health: HealthSnapshot,
    pub metrics: WorkerMetrics,
    pub tags: HashSet<String>,
    pub priority: u8,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl WorkerRegistration {
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn is_stale(&self, window: Duration) -> bool {
        Utc::now() - self.last_heartbeat > window
    }
}

/// Caller-supplied part of a registration.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub role: String,
    pub version: String,
    pub capabilities: Vec<Capability>,
    pub endpoint: String,
    pub tags: HashSet<String>,
    pub priority: u8,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, role: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            version: "1.0".to_string(),
            capabilities: Vec::new(),
            endpoint: endpoint.into(),
            tags: HashSet::new(),
            priority: 5,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_match() {
        let mut spec = WorkerSpec::new("builder-1", "builder", "local://builder-1");
        spec.capabilities.push(Capability::new("build"));

        let reg = WorkerRegistration {
            id: "w1".into(),
            name: spec.name,
            role: spec.role,
            version: spec.version,
            capabilities: spec.capabilities,
            endpoint: spec.endpoint,
            status: WorkerStatus::Active,
            registration_time: Utc::now(),
            last_heartbeat: Utc::now(),
            health: HealthSnapshot::initial(),
            metrics: WorkerMetrics::default(),
            tags: spec.tags,
            priority: spec.priority,
            timeout_secs: 30,
            max_retries: 3,
        };

        assert!(reg.has_capability("build"));
        assert!(!reg.has_capability("deploy"));
    }
}
