#[cfg(test)]
mod coordinator_tests {
    use std::sync::Arc;

    use ruscoord::{
        Coordinator,
        communication::{Mailbox, MessagePriority, Reply},
        registry::{Capability, FindCriteria, WorkerSpec, WorkerStatus},
        shared::CoordinatorConfig,
        workflow::{
            Condition, ExecutionStatus, ExecutionStrategy, StepStatus, WorkflowDefinition,
            WorkflowStep,
        },
    };

    /// 启动一个回显Worker: 收到请求后原样返回参数, 指定方法返回失败
    fn spawn_echo_worker(
        coordinator: Arc<Coordinator>,
        mailbox: Mailbox,
        fail_methods: Vec<&'static str>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let msg = mailbox.recv().await;
                let reply = if fail_methods.contains(&msg.method.as_str()) {
                    Reply::Failure(serde_json::json!({"reason": "refused"}))
                } else {
                    Reply::Success(serde_json::json!({"method": msg.method, "echo": msg.params}))
                };
                coordinator.respond(&msg, reply).await;
            }
        })
    }

    async fn wait_terminal(
        coordinator: &Arc<Coordinator>,
        execution_id: uuid::Uuid,
    ) -> ruscoord::workflow::WorkflowExecution {
        for _ in 0..500 {
            if let Some(execution) = coordinator.get_execution(execution_id).await {
                if execution.status.is_terminal() {
                    return execution;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("execution never reached a terminal state");
    }

    #[tokio::test]
    async fn test_registration_and_selection() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());

        // 注册两个同能力Worker, 优先级不同
        let spec_a = WorkerSpec::new("builder-a", "builder", "local://a")
            .with_capabilities(vec![Capability::new("build")])
            .with_priority(3);
        let spec_b = WorkerSpec::new("builder-b", "builder", "local://b")
            .with_capabilities(vec![Capability::new("build")])
            .with_priority(8);

        let (id_a, _mb_a) = coordinator.register_worker(spec_a).await.unwrap();
        let (id_b, _mb_b) = coordinator.register_worker(spec_b).await.unwrap();

        // id格式: {role}_{name}_{8位uuid}
        assert!(id_a.starts_with("builder_builder-a_"));

        // 高优先级Worker被选中
        let best = coordinator
            .find_worker(&FindCriteria::capability("build"))
            .await
            .unwrap();
        assert_eq!(best.id, id_b);

        // 排除后回落到低优先级Worker
        let fallback = coordinator
            .find_worker(&FindCriteria::capability("build").excluding([id_b.clone()]))
            .await
            .unwrap();
        assert_eq!(fallback.id, id_a);
    }

    #[tokio::test]
    async fn test_request_response_and_broadcast() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());

        let (id_1, mb_1) = coordinator
            .register_worker(WorkerSpec::new("w1", "worker", "local://w1"))
            .await
            .unwrap();
        let (_id_2, mb_2) = coordinator
            .register_worker(WorkerSpec::new("w2", "worker", "local://w2"))
            .await
            .unwrap();

        let worker = spawn_echo_worker(coordinator.clone(), mb_1, vec![]);

        // 请求-响应往返
        let reply = coordinator
            .request(
                "caller",
                &id_1,
                "ping",
                serde_json::json!({"n": 1}),
                MessagePriority::High,
                Some(5),
            )
            .await
            .unwrap();
        assert!(reply.is_success());

        // 广播覆盖除发送者外的所有活跃链路
        let delivered = coordinator
            .broadcast_message(&id_1, "announce", serde_json::json!({}), MessagePriority::Normal, &[])
            .await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(mb_2.recv().await.method, "announce");

        worker.abort();
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());

        let (id_pub, _mb_pub) = coordinator
            .register_worker(WorkerSpec::new("pub", "worker", "local://pub"))
            .await
            .unwrap();
        let (id_sub, mb_sub) = coordinator
            .register_worker(WorkerSpec::new("sub", "worker", "local://sub"))
            .await
            .unwrap();

        coordinator.subscribe(&id_sub, "deploys").await;

        let delivered = coordinator
            .publish(&id_pub, "deploys", serde_json::json!({"version": "1.2.3"}))
            .await;
        assert_eq!(delivered, 1);

        let event = mb_sub.recv().await;
        assert_eq!(event.method, "event.deploys");
        assert_eq!(event.params.unwrap()["version"], "1.2.3");

        // 退订后不再投递
        coordinator.unsubscribe(&id_sub, "deploys").await;
        assert_eq!(coordinator.publish(&id_pub, "deploys", serde_json::json!({})).await, 0);
    }

    #[tokio::test]
    async fn test_failure_quarantine_and_recovery() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (worker_id, _mailbox) = coordinator
            .register_worker(WorkerSpec::new("flaky", "worker", "local://flaky"))
            .await
            .unwrap();

        // 连续3次失败后隔离
        for _ in 0..3 {
            coordinator
                .registry()
                .apply_health_result(&worker_id, false, 1.0)
                .await;
        }
        let worker = coordinator.get_worker(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Error);

        // 隔离的Worker不再参与选择
        assert!(
            coordinator
                .find_worker(&FindCriteria::default().with_role("worker"))
                .await
                .is_none()
        );

        // 单次成功即恢复
        coordinator
            .registry()
            .apply_health_result(&worker_id, true, 0.1)
            .await;
        let worker = coordinator.get_worker(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Active);

        // 健康监督器的轮次也会看到恢复状态
        let report = coordinator.supervisor().run_round(&worker_id).await.unwrap();
        assert!(report.checks["heartbeat"].passed);
    }

    #[tokio::test]
    async fn test_sequential_workflow_failure_scenario() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let spec = WorkerSpec::new("runner", "worker", "local://runner").with_capabilities(vec![
            Capability::new("build"),
            Capability::new("test"),
            Capability::new("deploy"),
        ]);
        let (_id, mailbox) = coordinator.register_worker(spec).await.unwrap();
        let worker = spawn_echo_worker(coordinator.clone(), mailbox, vec!["test"]);

        // 三步链: a -> b -> c, b失败后c不再执行
        let definition = WorkflowDefinition::new("pipeline", "build pipeline")
            .with_strategy(ExecutionStrategy::Sequential)
            .with_steps(vec![
                WorkflowStep::new("a", "build"),
                WorkflowStep::new("b", "test")
                    .depends_on(["a".to_string()])
                    .with_retries(0),
                WorkflowStep::new("c", "deploy").depends_on(["b".to_string()]),
            ]);
        coordinator.register_workflow(definition).await.unwrap();

        let execution_id = coordinator
            .execute_workflow("pipeline", serde_json::json!({}))
            .await
            .unwrap();
        let execution = wait_terminal(&coordinator, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_status["a"], StepStatus::Completed);
        assert_eq!(execution.step_status["b"], StepStatus::Failed);
        assert_eq!(execution.step_status["c"], StepStatus::Waiting);
        // 完成步骤的结果进入运行上下文
        assert!(execution.context.contains_key("a"));

        worker.abort();
    }

    #[tokio::test]
    async fn test_parallel_workflow_with_condition() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let spec = WorkerSpec::new("runner", "worker", "local://runner").with_capabilities(vec![
            Capability::new("build"),
            Capability::new("test"),
            Capability::new("lint"),
            Capability::new("deploy"),
            Capability::new("notify"),
        ]);
        let (_id, mailbox) = coordinator.register_worker(spec).await.unwrap();
        let worker = spawn_echo_worker(coordinator.clone(), mailbox, vec![]);

        // 菱形依赖并行执行
        let diamond = WorkflowDefinition::new("diamond", "diamond")
            .with_strategy(ExecutionStrategy::Parallel)
            .with_steps(vec![
                WorkflowStep::new("a", "build"),
                WorkflowStep::new("b", "test").depends_on(["a".to_string()]),
                WorkflowStep::new("c", "lint").depends_on(["a".to_string()]),
                WorkflowStep::new("d", "deploy").depends_on(["b".to_string(), "c".to_string()]),
            ]);
        coordinator.register_workflow(diamond).await.unwrap();

        let execution_id = coordinator
            .execute_workflow("diamond", serde_json::json!({}))
            .await
            .unwrap();
        let execution = wait_terminal(&coordinator, execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.completed_steps, 4);

        // 条件策略: 输入门控关闭的步骤被跳过, 整体仍算完成
        let gated = WorkflowDefinition::new("gated", "gated notify")
            .with_strategy(ExecutionStrategy::Conditional)
            .with_steps(vec![
                WorkflowStep::new("a", "build"),
                WorkflowStep::new("b", "notify").when(Condition::Truthy { key: "announce".into() }),
            ]);
        coordinator.register_workflow(gated).await.unwrap();

        let execution_id = coordinator
            .execute_workflow("gated", serde_json::json!({"announce": false}))
            .await
            .unwrap();
        let execution = wait_terminal(&coordinator, execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_status["b"], StepStatus::Skipped);

        worker.abort();
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        ruscoord::shared::telemetry::init();
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.start().await;

        let (worker_id, mailbox) = coordinator
            .register_worker(
                WorkerSpec::new("solo", "worker", "local://solo")
                    .with_capabilities(vec![Capability::new("work")]),
            )
            .await
            .unwrap();
        let worker = spawn_echo_worker(coordinator.clone(), mailbox, vec![]);

        assert!(coordinator.heartbeat(&worker_id, None).await);

        let definition = WorkflowDefinition::new("single", "one step")
            .with_strategy(ExecutionStrategy::Sequential)
            .with_steps(vec![WorkflowStep::new("only", "work")]);
        coordinator.register_workflow(definition).await.unwrap();

        let execution_id = coordinator
            .execute_workflow("single", serde_json::json!({}))
            .await
            .unwrap();
        let execution = wait_terminal(&coordinator, execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let stats = coordinator.get_stats().await;
        assert_eq!(stats.registry.total_workers, 1);
        assert_eq!(stats.engine.succeeded, 1);
        assert!(stats.router.messages_sent >= 1);

        worker.abort();
        coordinator.shutdown().await;
        let worker = coordinator.get_worker(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Shutdown);
    }
}
