use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::communication::{
    CommunicationRouter, Mailbox, Message, MessagePriority, Reply, RouterConfig, RouterStats,
};
use crate::error::Result;
use crate::health::{
    CheckSpec, HealthEvent, HealthSupervisor, SupervisorConfig, SupervisorStats,
    WorkerHealthReport,
};
use crate::registry::{
    FindCriteria, RegistryConfig, RegistryEvent, RegistryStats, ServiceRegistry, WorkerMetrics,
    WorkerRegistration, WorkerSpec,
};
use crate::shared::{CoordinationContext, CoordinatorConfig};
use crate::workflow::{
    EngineConfig, EngineStats, WorkflowDefinition, WorkflowEngine, WorkflowExecution,
};

/// Aggregated statistics across every component.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub registry: RegistryStats,
    pub router: RouterStats,
    pub engine: EngineStats,
    pub supervisor: SupervisorStats,
    pub uptime_secs: i64,
}

/// 协调核心门面: 注册表, 路由器, 健康监督器和工作流引擎的统一入口。
///
/// Components stay individually accessible for advanced callers; the facade
/// keeps the cross-component wiring (register + attach + monitor) in one
/// place so they cannot drift apart.
pub struct Coordinator {
    context: CoordinationContext,
    registry: Arc<ServiceRegistry>,
    router: Arc<CommunicationRouter>,
    supervisor: Arc<HealthSupervisor>,
    engine: Arc<WorkflowEngine>,
    background: RwLock<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            probe_interval_secs: config.probe_interval_secs,
            max_consecutive_failures: config.max_consecutive_failures,
            cleanup_window_secs: config.cleanup_window_secs,
            reaper_interval_secs: config.reaper_interval_secs,
            ..Default::default()
        }));

        let router = Arc::new(CommunicationRouter::new(RouterConfig {
            inbox_capacity: config.inbox_capacity,
            default_timeout_secs: config.default_timeout_secs,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            ..Default::default()
        }));

        let supervisor = Arc::new(HealthSupervisor::new(
            registry.clone(),
            SupervisorConfig {
                round_interval_secs: config.probe_interval_secs,
                heartbeat_max_age_secs: config.heartbeat_interval_secs * 3,
                ..Default::default()
            },
        ));

        let engine = Arc::new(WorkflowEngine::new(
            registry.clone(),
            router.clone(),
            EngineConfig {
                history_capacity: config.history_capacity,
                sweep_interval_secs: config.workflow_sweep_interval_secs,
                retry_backoff_ms: config.retry_backoff_ms,
            },
        ));

        Arc::new(Self {
            context: CoordinationContext::new(config),
            registry,
            router,
            supervisor,
            engine,
            background: RwLock::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &CoordinationContext {
        &self.context
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<CommunicationRouter> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
        &self.supervisor
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// 启动所有后台巡检任务
    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.write().await;
        if !background.is_empty() {
            return;
        }

        background.push(self.registry.clone().start_probe_sweep());
        background.push(self.registry.clone().start_reaper());
        background.push(self.router.clone().start_heartbeat_monitor());
        background.push(self.engine.clone().start_timeout_sweep());
        info!("coordinator background loops started");
    }

    /// 停止后台任务并标记所有Worker下线
    pub async fn shutdown(&self) {
        for handle in self.background.write().await.drain(..) {
            handle.abort();
        }
        self.supervisor.shutdown().await;
        self.registry.shutdown().await;
        info!("coordinator shut down");
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    /// Register a worker with the whole plane: registry entry, message
    /// link and health monitor in one step.
    pub async fn register_worker(self: &Arc<Self>, spec: WorkerSpec) -> Result<(String, Mailbox)> {
        let worker_id = self.registry.register(spec).await?;
        let mailbox = match self.router.attach(worker_id.clone()).await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                // Keep registration atomic from the caller's view.
                self.registry.unregister(&worker_id).await;
                return Err(e);
            }
        };
        self.supervisor.start_monitoring(&worker_id).await;
        Ok((worker_id, mailbox))
    }

    /// Tear a worker out of every component. Idempotent.
    pub async fn deregister_worker(&self, worker_id: &str) -> bool {
        self.supervisor.stop_monitoring(worker_id).await;
        self.router.detach(worker_id).await;
        self.registry.unregister(worker_id).await
    }

    /// One heartbeat refreshes both the registry entry and the message link.
    pub async fn heartbeat(&self, worker_id: &str, metrics: Option<WorkerMetrics>) -> bool {
        let known = self.registry.heartbeat(worker_id, metrics).await;
        if known {
            self.router.record_heartbeat(worker_id).await;
        }
        known
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerRegistration> {
        self.registry.get_worker(worker_id).await
    }

    pub async fn find_worker(&self, criteria: &FindCriteria) -> Option<WorkerRegistration> {
        self.registry.find_best(criteria).await
    }

    pub fn subscribe_registry_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe_events()
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    pub async fn send_message(&self, message: Message) -> Result<Uuid> {
        self.router.send(message).await
    }

    pub async fn request(
        &self,
        sender: &str,
        receiver: &str,
        method: &str,
        params: serde_json::Value,
        priority: MessagePriority,
        timeout_secs: Option<u64>,
    ) -> Result<Reply> {
        self.router
            .request(sender, receiver, method, params, priority, timeout_secs)
            .await
    }

    pub async fn respond(&self, original: &Message, reply: Reply) -> bool {
        self.router.respond(original, reply).await
    }

    pub async fn broadcast_message(
        &self,
        sender: &str,
        method: &str,
        params: serde_json::Value,
        priority: MessagePriority,
        exclude: &[String],
    ) -> Vec<Uuid> {
        let exclude: std::collections::HashSet<String> = exclude.iter().cloned().collect();
        self.router.broadcast(sender, method, params, priority, &exclude).await
    }

    pub async fn subscribe(&self, worker_id: &str, topic: &str) {
        self.router.subscribe(worker_id, topic).await;
    }

    pub async fn unsubscribe(&self, worker_id: &str, topic: &str) {
        self.router.unsubscribe(worker_id, topic).await;
    }

    pub async fn publish(
        &self,
        publisher: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> usize {
        self.router
            .publish(publisher, topic, payload, MessagePriority::Normal)
            .await
    }

    // ------------------------------------------------------------------
    // Workflows
    // ------------------------------------------------------------------

    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        self.engine.register_workflow(definition).await
    }

    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> Result<Uuid> {
        self.engine.execute_workflow(workflow_id, input).await
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.engine.get_execution(execution_id).await
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> bool {
        self.engine.cancel_execution(execution_id).await
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn add_health_check(&self, check: CheckSpec) {
        self.supervisor.add_check(check).await;
    }

    pub async fn get_health(&self, worker_id: &str) -> Option<WorkerHealthReport> {
        self.supervisor.get_report(worker_id).await
    }

    pub fn subscribe_health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.supervisor.subscribe_events()
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    pub async fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            registry: self.registry.get_stats().await,
            router: self.router.get_stats().await,
            engine: self.engine.get_stats().await,
            supervisor: self.supervisor.get_stats().await,
            uptime_secs: (chrono::Utc::now() - self.context.runtime_info.start_time).num_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Capability;

    fn coordinator() -> Arc<Coordinator> {
        Coordinator::new(CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn test_register_wires_all_components() {
        let coordinator = coordinator();
        let spec = WorkerSpec::new("builder-1", "builder", "local://builder-1")
            .with_capabilities(vec![Capability::new("build")]);

        let (worker_id, _mailbox) = coordinator.register_worker(spec).await.unwrap();

        assert!(coordinator.get_worker(&worker_id).await.is_some());
        assert!(coordinator.router().is_active(&worker_id).await);
        assert!(coordinator.supervisor().is_monitored(&worker_id).await);
    }

    #[tokio::test]
    async fn test_deregister_tears_down_everywhere() {
        let coordinator = coordinator();
        let (worker_id, _mailbox) = coordinator
            .register_worker(WorkerSpec::new("w", "worker", "local://w"))
            .await
            .unwrap();

        assert!(coordinator.deregister_worker(&worker_id).await);
        assert!(coordinator.get_worker(&worker_id).await.is_none());
        assert!(!coordinator.router().is_active(&worker_id).await);
        assert!(!coordinator.supervisor().is_monitored(&worker_id).await);

        // Second deregistration is a clean no-op.
        assert!(!coordinator.deregister_worker(&worker_id).await);
    }

    #[tokio::test]
    async fn test_request_roundtrip_through_facade() {
        let coordinator = coordinator();
        let (worker_id, mailbox) = coordinator
            .register_worker(WorkerSpec::new("echo", "worker", "local://echo"))
            .await
            .unwrap();

        let responder = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let msg = mailbox.recv().await;
                let params = msg.params.clone().unwrap_or_default();
                coordinator.respond(&msg, Reply::Success(params)).await;
            })
        };

        let reply = coordinator
            .request(
                "caller",
                &worker_id,
                "echo",
                serde_json::json!({"hello": "world"}),
                MessagePriority::Normal,
                Some(5),
            )
            .await
            .unwrap();

        assert_eq!(reply, Reply::Success(serde_json::json!({"hello": "world"})));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_aggregate_components() {
        let coordinator = coordinator();
        coordinator
            .register_worker(WorkerSpec::new("w", "worker", "local://w"))
            .await
            .unwrap();

        let stats = coordinator.get_stats().await;
        assert_eq!(stats.registry.total_workers, 1);
        assert_eq!(stats.router.total_links, 1);
        assert_eq!(stats.engine.registered_workflows, 0);
        assert!(stats.uptime_secs >= 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let coordinator = coordinator();
        coordinator.start().await;
        coordinator.start().await;
        assert_eq!(coordinator.background.read().await.len(), 4);
        coordinator.shutdown().await;
        assert!(coordinator.background.read().await.is_empty());
    }
}
