use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::coordination_error::CoordinationError;
use crate::error::{Error, Result};
use crate::registry::types::{
    HealthSnapshot, WorkerMetrics, WorkerRegistration, WorkerSpec, WorkerStatus,
};

/// Probe used by the periodic health sweep. The default implementation
/// answers locally; deployments wire in a real endpoint check.
#[async_trait]
pub trait WorkerProbe: Send + Sync {
    async fn probe(&self, worker: &WorkerRegistration) -> Result<()>;
}

/// In-process probe: every worker answers immediately.
struct LoopbackProbe;

#[async_trait]
impl WorkerProbe for LoopbackProbe {
    async fn probe(&self, _worker: &WorkerRegistration) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub max_consecutive_failures: u32,
    pub cleanup_window_secs: i64,
    pub reaper_interval_secs: u64,
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            probe_timeout_secs: 5,
            max_consecutive_failures: 3,
            cleanup_window_secs: 300,
            reaper_interval_secs: 60,
            event_capacity: 256,
        }
    }
}

/// Status-change notifications emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered { worker_id: String },
    Unregistered { worker_id: String },
    StatusChanged {
        worker_id: String,
        old: WorkerStatus,
        new: WorkerStatus,
    },
    WorkerFailed { worker_id: String },
}

/// Selection filter for [`ServiceRegistry::find_best`].
#[derive(Debug, Clone, Default)]
pub struct FindCriteria {
    pub role: Option<String>,
    pub required_capabilities: Vec<String>,
    pub tags: HashSet<String>,
    pub exclude: HashSet<String>,
}

impl FindCriteria {
    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            required_capabilities: vec![name.into()],
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.exclude = ids.into_iter().collect();
        self
    }
}

/// Source of truth for which workers exist, their capabilities, status and
/// health. Other components hold worker ids, never references into the maps.
pub struct ServiceRegistry {
    workers: Arc<RwLock<HashMap<String, WorkerRegistration>>>,
    role_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    capability_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    tag_index: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    probe: Arc<dyn WorkerProbe>,
    events: broadcast::Sender<RegistryEvent>,
    health_checks_performed: AtomicU64,
    total_registrations: AtomicU64,
    config: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_probe(config, Arc::new(LoopbackProbe))
    }

    pub fn with_probe(config: RegistryConfig, probe: Arc<dyn WorkerProbe>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);

        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            role_index: Arc::new(RwLock::new(HashMap::new())),
            capability_index: Arc::new(RwLock::new(HashMap::new())),
            tag_index: Arc::new(RwLock::new(HashMap::new())),
            probe,
            events,
            health_checks_performed: AtomicU64::new(0),
            total_registrations: AtomicU64::new(0),
            config,
        }
    }

    /// Subscribe to registry events. Receivers that lag simply miss events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a worker and index it by role, capability and tag.
    ///
    /// Rejects empty name/endpoint before any mutation.
    pub async fn register(&self, spec: WorkerSpec) -> Result<String> {
        if spec.name.is_empty() || spec.endpoint.is_empty() {
            return Err(Error::CoordinationError(CoordinationError::Registration(
                "worker name and endpoint must be non-empty".into(),
            )));
        }

        let suffix = Uuid::new_v4().simple().to_string();
        let worker_id = format!("{}_{}_{}", spec.role, spec.name, &suffix[..8]);

        let now = Utc::now();
        let registration = WorkerRegistration {
            id: worker_id.clone(),
            name: spec.name,
            role: spec.role,
            version: spec.version,
            capabilities: spec.capabilities,
            endpoint: spec.endpoint,
            status: WorkerStatus::Active,
            registration_time: now,
            last_heartbeat: now,
            health: HealthSnapshot::initial(),
            metrics: WorkerMetrics {
                last_activity: Some(now),
                ..Default::default()
            },
            tags: spec.tags,
            priority: spec.priority,
            timeout_secs: 30,
            max_retries: 3,
        };

        {
            let mut workers = self.workers.write().await;
            if workers.contains_key(&worker_id) {
                return Err(Error::CoordinationError(
                    CoordinationError::DuplicateRegistration(worker_id),
                ));
            }
            workers.insert(worker_id.clone(), registration.clone());
        }

        self.index_worker(&registration).await;
        self.total_registrations.fetch_add(1, Ordering::Relaxed);

        let _ = self.events.send(RegistryEvent::Registered {
            worker_id: worker_id.clone(),
        });

        info!("worker {} registered", worker_id);
        Ok(worker_id)
    }

    /// Remove a worker and all of its index entries.
    ///
    /// Idempotent: unknown ids return `false` rather than erroring.
    pub async fn unregister(&self, worker_id: &str) -> bool {
        let removed = self.workers.write().await.remove(worker_id);

        let Some(registration) = removed else {
            return false;
        };

        self.unindex_worker(&registration).await;

        let _ = self.events.send(RegistryEvent::Unregistered {
            worker_id: worker_id.to_string(),
        });

        info!("worker {} unregistered", worker_id);
        true
    }

    /// Set a worker's status, emitting a `StatusChanged` event on transitions.
    pub async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> bool {
        let old = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return false;
            };
            let old = worker.status;
            worker.status = status;
            old
        };

        if old != status {
            let _ = self.events.send(RegistryEvent::StatusChanged {
                worker_id: worker_id.to_string(),
                old,
                new: status,
            });
        }

        true
    }

    /// Record a heartbeat: refresh last-seen time and metrics, and self-heal
    /// an Inactive/Error worker back to Active.
    pub async fn heartbeat(&self, worker_id: &str, metrics: Option<WorkerMetrics>) -> bool {
        let needs_heal = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return false;
            };

            let now = Utc::now();
            worker.last_heartbeat = now;
            if let Some(mut metrics) = metrics {
                metrics.last_activity = Some(now);
                worker.metrics = metrics;
            }

            // Any sign of life counts as a success for the failure counter.
            worker.health.is_healthy = true;
            worker.health.consecutive_failures = 0;

            matches!(worker.status, WorkerStatus::Inactive | WorkerStatus::Error)
        };

        if needs_heal {
            self.update_status(worker_id, WorkerStatus::Active).await;
        }

        true
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerRegistration> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn all_workers(&self) -> Vec<WorkerRegistration> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn workers_by_role(&self, role: &str) -> Vec<WorkerRegistration> {
        let ids = self.role_index.read().await.get(role).cloned();
        self.collect_ids(ids).await
    }

    pub async fn workers_by_capability(&self, capability: &str) -> Vec<WorkerRegistration> {
        let ids = self.capability_index.read().await.get(capability).cloned();
        self.collect_ids(ids).await
    }

    pub async fn workers_by_tag(&self, tag: &str) -> Vec<WorkerRegistration> {
        let ids = self.tag_index.read().await.get(tag).cloned();
        self.collect_ids(ids).await
    }

    pub async fn active_workers(&self) -> Vec<WorkerRegistration> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .cloned()
            .collect()
    }

    pub async fn healthy_workers(&self) -> Vec<WorkerRegistration> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status == WorkerStatus::Active && w.health.is_healthy)
            .cloned()
            .collect()
    }

    /// Pick the best Active, healthy worker matching the criteria.
    ///
    /// Candidates come from the indices, never a full scan when a filter is
    /// present. Ranking: priority desc, probe response time asc, successful
    /// request count desc.
    pub async fn find_best(&self, criteria: &FindCriteria) -> Option<WorkerRegistration> {
        let mut candidates = self.candidate_set(criteria).await;

        candidates.retain(|w| {
            if criteria.exclude.contains(&w.id) {
                return false;
            }
            if w.status != WorkerStatus::Active || !w.health.is_healthy {
                return false;
            }
            if !criteria
                .required_capabilities
                .iter()
                .all(|c| w.has_capability(c))
            {
                return false;
            }
            if !criteria.tags.is_empty() && criteria.tags.is_disjoint(&w.tags) {
                return false;
            }
            true
        });

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(
                    a.health
                        .response_time
                        .partial_cmp(&b.health.response_time)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.metrics.successful_requests.cmp(&a.metrics.successful_requests))
        });

        candidates.into_iter().next()
    }

    async fn candidate_set(&self, criteria: &FindCriteria) -> Vec<WorkerRegistration> {
        if let Some(role) = &criteria.role {
            return self.workers_by_role(role).await;
        }
        if let Some(capability) = criteria.required_capabilities.first() {
            return self.workers_by_capability(capability).await;
        }
        if !criteria.tags.is_empty() {
            let tag_index = self.tag_index.read().await;
            let mut ids = HashSet::new();
            for tag in &criteria.tags {
                if let Some(set) = tag_index.get(tag) {
                    ids.extend(set.iter().cloned());
                }
            }
            drop(tag_index);
            return self.collect_ids(Some(ids)).await;
        }
        self.all_workers().await
    }

    /// Probe one worker and fold the outcome into its health snapshot.
    ///
    /// Returns `None` for unknown ids.
    pub async fn perform_health_check(&self, worker_id: &str) -> Option<HealthSnapshot> {
        let worker = self.get_worker(worker_id).await?;

        let started = std::time::Instant::now();
        let timeout = std::time::Duration::from_secs(self.config.probe_timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.probe.probe(&worker)).await;

        let (healthy, response_time) = match outcome {
            Ok(Ok(())) => (true, started.elapsed().as_secs_f64()),
            Ok(Err(e)) => {
                debug!("probe for {} failed: {}", worker_id, e);
                (false, self.config.probe_timeout_secs as f64)
            }
            Err(_) => {
                debug!("probe for {} timed out", worker_id);
                (false, self.config.probe_timeout_secs as f64)
            }
        };

        self.health_checks_performed.fetch_add(1, Ordering::Relaxed);
        self.apply_health_result(worker_id, healthy, response_time).await
    }

    /// Fold an externally observed health result into the snapshot. Used by
    /// the probe sweep and by the health supervisor's write-back.
    ///
    /// Crossing the consecutive-failure threshold quarantines the worker:
    /// status goes to Error and a `WorkerFailed` event fires.
    pub async fn apply_health_result(
        &self,
        worker_id: &str,
        is_healthy: bool,
        response_time: f64,
    ) -> Option<HealthSnapshot> {
        let (snapshot, tripped) = {
            let mut workers = self.workers.write().await;
            let worker = workers.get_mut(worker_id)?;

            let health = &mut worker.health;
            health.check_count += 1;
            health.last_check = Utc::now();
            health.response_time = response_time;
            health.is_healthy = is_healthy;
            if is_healthy {
                health.consecutive_failures = 0;
            } else {
                health.consecutive_failures += 1;
            }

            let tripped = !is_healthy
                && health.consecutive_failures >= self.config.max_consecutive_failures
                && worker.status != WorkerStatus::Error;

            (health.clone(), tripped)
        };

        if tripped {
            warn!(
                "worker {} failed {} consecutive checks, quarantining",
                worker_id, snapshot.consecutive_failures
            );
            self.update_status(worker_id, WorkerStatus::Error).await;
            let _ = self.events.send(RegistryEvent::WorkerFailed {
                worker_id: worker_id.to_string(),
            });
        } else if is_healthy {
            // A successful probe restores a quarantined worker.
            let status = self.get_worker(worker_id).await.map(|w| w.status);
            if matches!(status, Some(WorkerStatus::Error | WorkerStatus::Inactive)) {
                self.update_status(worker_id, WorkerStatus::Active).await;
            }
        }

        Some(snapshot)
    }

    /// Update request counters after a dispatch.
    pub async fn record_request_outcome(&self, worker_id: &str, success: bool, elapsed: f64) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(worker_id) {
            let metrics = &mut worker.metrics;
            metrics.requests_processed += 1;
            if success {
                metrics.successful_requests += 1;
            } else {
                metrics.failed_requests += 1;
            }
            let n = metrics.requests_processed as f64;
            metrics.average_response_time =
                (metrics.average_response_time * (n - 1.0) + elapsed) / n;
            metrics.last_activity = Some(Utc::now());
        }
    }

    /// Drop every worker whose last heartbeat is older than the cleanup
    /// window. Returns the reaped ids.
    pub async fn reap_stale(&self) -> Vec<String> {
        let window = Duration::seconds(self.config.cleanup_window_secs);

        let stale: Vec<String> = self
            .workers
            .read()
            .await
            .values()
            .filter(|w| w.is_stale(window))
            .map(|w| w.id.clone())
            .collect();

        for worker_id in &stale {
            warn!("reaping stale worker {}", worker_id);
            self.unregister(worker_id).await;
        }

        stale
    }

    /// Periodic probe sweep over every registered worker.
    pub fn start_probe_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.probe_interval_secs;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
                for worker_id in ids {
                    if self.perform_health_check(&worker_id).await.is_none() {
                        // Unregistered mid-sweep.
                        continue;
                    }
                }
            }
        })
    }

    /// Periodic reaper for workers that crashed without deregistering.
    pub fn start_reaper(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.reaper_interval_secs;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let reaped = self.reap_stale().await;
                if !reaped.is_empty() {
                    info!("reaped {} stale workers", reaped.len());
                }
            }
        })
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let workers = self.workers.read().await;

        let mut status_distribution = HashMap::new();
        for worker in workers.values() {
            *status_distribution.entry(worker.status).or_insert(0) += 1;
        }

        let active = workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active)
            .count();
        let healthy = workers
            .values()
            .filter(|w| w.status == WorkerStatus::Active && w.health.is_healthy)
            .count();

        RegistryStats {
            total_workers: workers.len(),
            active_workers: active,
            healthy_workers: healthy,
            status_distribution,
            total_registrations: self.total_registrations.load(Ordering::Relaxed),
            health_checks_performed: self.health_checks_performed.load(Ordering::Relaxed),
            capabilities_indexed: self.capability_index.read().await.len(),
            tags_indexed: self.tag_index.read().await.len(),
        }
    }

    /// Mark every remaining worker Shutdown. Called on coordinator shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        for worker_id in ids {
            self.update_status(&worker_id, WorkerStatus::Shutdown).await;
        }
    }

    async fn index_worker(&self, registration: &WorkerRegistration) {
        self.role_index
            .write()
            .await
            .entry(registration.role.clone())
            .or_default()
            .insert(registration.id.clone());

        let mut cap_index = self.capability_index.write().await;
        for capability in &registration.capabilities {
            cap_index
                .entry(capability.name.clone())
                .or_default()
                .insert(registration.id.clone());
        }
        drop(cap_index);

        let mut tag_index = self.tag_index.write().await;
        for tag in &registration.tags {
            tag_index
                .entry(tag.clone())
                .or_default()
                .insert(registration.id.clone());
        }
    }

    async fn unindex_worker(&self, registration: &WorkerRegistration) {
        let mut role_index = self.role_index.write().await;
        if let Some(ids) = role_index.get_mut(&registration.role) {
            ids.remove(&registration.id);
            if ids.is_empty() {
                role_index.remove(&registration.role);
            }
        }
        drop(role_index);

        let mut cap_index = self.capability_index.write().await;
        for capability in &registration.capabilities {
            if let Some(ids) = cap_index.get_mut(&capability.name) {
                ids.remove(&registration.id);
                if ids.is_empty() {
                    cap_index.remove(&capability.name);
                }
            }
        }
        drop(cap_index);

        let mut tag_index = self.tag_index.write().await;
        for tag in &registration.tags {
            if let Some(ids) = tag_index.get_mut(tag) {
                ids.remove(&registration.id);
                if ids.is_empty() {
                    tag_index.remove(tag);
                }
            }
        }
    }

    async fn collect_ids(&self, ids: Option<HashSet<String>>) -> Vec<WorkerRegistration> {
        let Some(ids) = ids else {
            return Vec::new();
        };
        let workers = self.workers.read().await;
        ids.iter().filter_map(|id| workers.get(id).cloned()).collect()
    }
}

/// Registry statistics for the monitoring surface.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub status_distribution: HashMap<WorkerStatus, usize>,
    pub total_registrations: u64,
    pub health_checks_performed: u64,
    pub capabilities_indexed: usize,
    pub tags_indexed: usize,
}
