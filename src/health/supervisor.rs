use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{ServiceRegistry, WorkerRegistration};

/// EMA weights for the smoothed response time.
const EMA_OLD: f64 = 0.8;
const EMA_NEW: f64 = 0.2;

/// Caller-supplied health probe. `check` returning `Ok` means the worker
/// passed this probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, worker: &WorkerRegistration) -> Result<()>;
}

/// What a check actually verifies.
#[derive(Clone)]
pub enum CheckKind {
    /// Passes while the registry heartbeat is younger than `max_age_secs`.
    Heartbeat { max_age_secs: u64 },
    /// Delegates to a caller-supplied probe.
    Custom(Arc<dyn HealthProbe>),
}

impl std::fmt::Debug for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckKind::Heartbeat { max_age_secs } => {
                f.debug_struct("Heartbeat").field("max_age_secs", max_age_secs).finish()
            }
            CheckKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A named check applied to every monitored worker once per round.
#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub timeout_secs: u64,
    /// Retries within a single round before the check counts as failed.
    pub max_retries: u32,
}

impl CheckSpec {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout_secs: 5,
            max_retries: 0,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Aggregated health of one worker over its configured checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    /// Every check passed.
    Healthy,
    /// At least half of the checks passed.
    Degraded,
    Unhealthy,
    /// No round has run yet.
    Unknown,
}

/// Outcome of one check within a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub response_time: f64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Rolling health view of one monitored worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    pub worker_id: String,
    pub state: HealthState,
    pub checks: HashMap<String, CheckResult>,
    /// Exponentially smoothed round response time.
    pub ema_response_time: f64,
    pub rounds: u64,
    pub healthy_rounds: u64,
    pub consecutive_unhealthy: u32,
    pub last_round: Option<DateTime<Utc>>,
    /// Recent round outcomes, oldest first, capped.
    pub recent: VecDeque<(DateTime<Utc>, HealthState)>,
}

impl WorkerHealthReport {
    fn new(worker_id: String) -> Self {
        Self {
            worker_id,
            state: HealthState::Unknown,
            checks: HashMap::new(),
            ema_response_time: 0.0,
            rounds: 0,
            healthy_rounds: 0,
            consecutive_unhealthy: 0,
            last_round: None,
            recent: VecDeque::new(),
        }
    }

    /// Share of rounds that aggregated to Healthy, in percent.
    pub fn uptime_percent(&self) -> f64 {
        if self.rounds == 0 {
            return 100.0;
        }
        self.healthy_rounds as f64 / self.rounds as f64 * 100.0
    }
}

/// Health state transitions, fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BecameUnhealthy { worker_id: String },
    Degraded { worker_id: String },
    Recovered { worker_id: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Seconds between rounds for each monitored worker.
    pub round_interval_secs: u64,
    /// Heartbeat staleness tolerance for the built-in heartbeat check.
    pub heartbeat_max_age_secs: u64,
    /// Cap on the per-worker recent-round buffer.
    pub history_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            round_interval_secs: 30,
            heartbeat_max_age_secs: 30,
            history_capacity: 50,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub monitored_workers: usize,
    pub checks: usize,
    pub rounds_performed: u64,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Runs configured checks against monitored workers, aggregates the
/// results and folds them back into the registry.
///
/// 聚合规则: 全部通过 -> Healthy, 通过率 >= 50% -> Degraded, 否则 Unhealthy.
pub struct HealthSupervisor {
    registry: Arc<ServiceRegistry>,
    checks: Arc<RwLock<Vec<CheckSpec>>>,
    reports: Arc<RwLock<HashMap<String, WorkerHealthReport>>>,
    monitors: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    events: broadcast::Sender<HealthEvent>,
    rounds_performed: std::sync::atomic::AtomicU64,
    config: SupervisorConfig,
}

impl HealthSupervisor {
    /// A new supervisor carries one built-in heartbeat-staleness check;
    /// further checks are added with [`add_check`].
    pub fn new(registry: Arc<ServiceRegistry>, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let heartbeat = CheckSpec::new(
            "heartbeat",
            CheckKind::Heartbeat { max_age_secs: config.heartbeat_max_age_secs },
        );

        Self {
            registry,
            checks: Arc::new(RwLock::new(vec![heartbeat])),
            reports: Arc::new(RwLock::new(HashMap::new())),
            monitors: Arc::new(RwLock::new(HashMap::new())),
            events,
            rounds_performed: std::sync::atomic::AtomicU64::new(0),
            config,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub async fn add_check(&self, check: CheckSpec) {
        self.checks.write().await.push(check);
    }

    pub async fn remove_check(&self, name: &str) -> bool {
        let mut checks = self.checks.write().await;
        let before = checks.len();
        checks.retain(|c| c.name != name);
        checks.len() != before
    }

    /// Start the periodic monitor task for a worker. Returns false when the
    /// worker is already monitored.
    pub async fn start_monitoring(self: &Arc<Self>, worker_id: &str) -> bool {
        let mut monitors = self.monitors.write().await;
        if monitors.contains_key(worker_id) {
            return false;
        }

        let supervisor = self.clone();
        let id = worker_id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
                supervisor.config.round_interval_secs,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                // The worker disappearing from the registry ends the monitor.
                if supervisor.run_round(&id).await.is_none() {
                    debug!("worker {} gone, monitor exiting", id);
                    supervisor.monitors.write().await.remove(&id);
                    supervisor.reports.write().await.remove(&id);
                    break;
                }
            }
        });

        monitors.insert(worker_id.to_string(), handle);
        info!("monitoring started for worker {}", worker_id);
        true
    }

    /// Stop a worker's monitor task and drop its report.
    pub async fn stop_monitoring(&self, worker_id: &str) -> bool {
        let handle = self.monitors.write().await.remove(worker_id);
        match handle {
            Some(handle) => {
                handle.abort();
                self.reports.write().await.remove(worker_id);
                info!("monitoring stopped for worker {}", worker_id);
                true
            }
            None => false,
        }
    }

    /// Run one round of every check against a worker and fold the outcome
    /// into its report and the registry. `None` for unknown workers.
    pub async fn run_round(&self, worker_id: &str) -> Option<WorkerHealthReport> {
        let worker = self.registry.get_worker(worker_id).await?;
        let checks = self.checks.read().await.clone();
        let now = Utc::now();

        let mut results = HashMap::new();
        let mut passed = 0usize;
        let mut round_time = 0.0f64;

        for check in &checks {
            let result = self.run_check(check, &worker).await;
            if result.passed {
                passed += 1;
            }
            round_time += result.response_time;
            results.insert(check.name.clone(), result);
        }

        let state = Self::aggregate(passed, checks.len());
        self.rounds_performed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let (report, previous) = {
            let mut reports = self.reports.write().await;
            let report = reports
                .entry(worker_id.to_string())
                .or_insert_with(|| WorkerHealthReport::new(worker_id.to_string()));
            let previous = report.state;

            report.state = state;
            report.checks = results;
            report.rounds += 1;
            report.last_round = Some(now);
            report.ema_response_time = if report.rounds == 1 {
                round_time
            } else {
                report.ema_response_time * EMA_OLD + round_time * EMA_NEW
            };
            if state == HealthState::Healthy {
                report.healthy_rounds += 1;
            }
            if state == HealthState::Unhealthy {
                report.consecutive_unhealthy += 1;
            } else {
                report.consecutive_unhealthy = 0;
            }
            if report.recent.len() >= self.config.history_capacity {
                report.recent.pop_front();
            }
            report.recent.push_back((now, state));

            (report.clone(), previous)
        };

        self.emit_transition(worker_id, previous, state);

        // Write-back keeps the registry's quarantine logic authoritative.
        // The smoothed time is what feeds selection ranking, so one slow
        // round does not bounce the worker to the back of the queue.
        self.registry
            .apply_health_result(
                worker_id,
                state != HealthState::Unhealthy,
                report.ema_response_time,
            )
            .await;

        Some(report)
    }

    pub async fn get_report(&self, worker_id: &str) -> Option<WorkerHealthReport> {
        self.reports.read().await.get(worker_id).cloned()
    }

    pub async fn all_reports(&self) -> Vec<WorkerHealthReport> {
        self.reports.read().await.values().cloned().collect()
    }

    pub async fn is_monitored(&self, worker_id: &str) -> bool {
        self.monitors.read().await.contains_key(worker_id)
    }

    pub async fn get_stats(&self) -> SupervisorStats {
        let reports = self.reports.read().await;
        let count = |s: HealthState| reports.values().filter(|r| r.state == s).count();

        SupervisorStats {
            monitored_workers: self.monitors.read().await.len(),
            checks: self.checks.read().await.len(),
            rounds_performed: self.rounds_performed.load(std::sync::atomic::Ordering::Relaxed),
            healthy: count(HealthState::Healthy),
            degraded: count(HealthState::Degraded),
            unhealthy: count(HealthState::Unhealthy),
        }
    }

    /// Abort every monitor task.
    pub async fn shutdown(&self) {
        let mut monitors = self.monitors.write().await;
        for (worker_id, handle) in monitors.drain() {
            debug!("stopping monitor for {}", worker_id);
            handle.abort();
        }
    }

    async fn run_check(&self, check: &CheckSpec, worker: &WorkerRegistration) -> CheckResult {
        let timeout = std::time::Duration::from_secs(check.timeout_secs);
        let mut error = None;

        for _attempt in 0..=check.max_retries {
            let started = std::time::Instant::now();
            let outcome = match &check.kind {
                CheckKind::Heartbeat { max_age_secs } => {
                    let age = Utc::now() - worker.last_heartbeat;
                    if age <= chrono::Duration::seconds(*max_age_secs as i64) {
                        Ok(())
                    } else {
                        Err(format!("heartbeat {}s stale", age.num_seconds()))
                    }
                }
                CheckKind::Custom(probe) => {
                    match tokio::time::timeout(timeout, probe.check(worker)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("timed out after {}s", check.timeout_secs)),
                    }
                }
            };

            match outcome {
                Ok(()) => {
                    return CheckResult {
                        name: check.name.clone(),
                        passed: true,
                        response_time: started.elapsed().as_secs_f64(),
                        error: None,
                        checked_at: Utc::now(),
                    };
                }
                Err(e) => error = Some(e),
            }
        }

        CheckResult {
            name: check.name.clone(),
            passed: false,
            response_time: check.timeout_secs as f64,
            error,
            checked_at: Utc::now(),
        }
    }

    fn aggregate(passed: usize, total: usize) -> HealthState {
        if total == 0 || passed == total {
            HealthState::Healthy
        } else if passed * 2 >= total {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        }
    }

    fn emit_transition(&self, worker_id: &str, previous: HealthState, current: HealthState) {
        // An Unknown baseline behaves like Healthy so the first round only
        // fires on actual trouble.
        let previous = if previous == HealthState::Unknown {
            HealthState::Healthy
        } else {
            previous
        };
        if previous == current {
            return;
        }

        let event = match current {
            HealthState::Unhealthy => {
                warn!("worker {} became unhealthy", worker_id);
                HealthEvent::BecameUnhealthy { worker_id: worker_id.to_string() }
            }
            HealthState::Degraded => {
                warn!("worker {} degraded", worker_id);
                HealthEvent::Degraded { worker_id: worker_id.to_string() }
            }
            HealthState::Healthy => {
                info!("worker {} recovered", worker_id);
                HealthEvent::Recovered { worker_id: worker_id.to_string() }
            }
            HealthState::Unknown => return,
        };
        let _ = self.events.send(event);
    }
}
