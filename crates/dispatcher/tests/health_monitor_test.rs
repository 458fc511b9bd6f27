#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use taskmesh_core::models::{
        ConnectivityEventKind, ProbeProtocol, Resources, TaskStatus, TransportConfig,
        WorkerHealth, WorkerRegistration,
    };
    use taskmesh_core::{AppConfig, RetryConfig};
    use taskmesh_dispatcher::{DispatcherContext, Repositories, TransportRouter};
    use taskmesh_testing_utils::{
        spawn_tcp_listener, wait_for, MockExecutionTransport, MockStore, TaskBuilder,
        WorkerBuilder,
    };

    fn build(store: &MockStore, transport: &MockExecutionTransport) -> DispatcherContext {
        let mut config = AppConfig::default();
        config.health.heartbeat_ttl_seconds = 60;
        config.health.probe_timeout_seconds = 1;
        config.retry = RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        };
        DispatcherContext::build(
            Repositories {
                tasks: store.task_repository(),
                workers: store.worker_repository(),
                checkpoints: store.checkpoint_repository(),
                events: store.connectivity_repository(),
            },
            &config,
            TransportRouter::new(Arc::new(transport.clone())),
            None,
        )
    }

    #[tokio::test]
    async fn test_registered_worker_becomes_eligible_after_probe() {
        let store = MockStore::new();
        let transport = MockExecutionTransport::new();
        let ctx = build(&store, &transport);
        let addr = spawn_tcp_listener().await;

        let worker = ctx
            .registry
            .register(WorkerRegistration {
                hostname: "build-01".to_string(),
                transport: TransportConfig::new(ProbeProtocol::Tcp, addr.to_string()),
                capabilities: vec!["rust".to_string()],
                resources: Resources::default(),
                max_concurrent_tasks: 2,
            })
            .await
            .unwrap();
        let task = ctx
            .graph
            .submit(TaskBuilder::new().with_capabilities(&["rust"]).build())
            .await
            .unwrap();

        let report = ctx.scheduler.dispatch_cycle().await.unwrap();
        assert_eq!(report.deferred, 1);

        let sweep = ctx.monitor.sweep_once().await.unwrap();
        assert_eq!(sweep.transitions[0].to, WorkerHealth::Healthy);

        let report = ctx.scheduler.dispatch_cycle().await.unwrap();
        assert_eq!(report.assigned, 1);
        assert!(
            wait_for(
                || {
                    let store = store.clone();
                    async move {
                        store.task(task.id).map(|t| t.status) == Some(TaskStatus::Completed)
                    }
                },
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(transport.dispatched()[0].0, worker.id);
    }

    #[tokio::test]
    async fn test_silent_worker_lost_and_work_reassigned() {
        let store = MockStore::new();
        let transport = MockExecutionTransport::new();
        let ctx = build(&store, &transport);

        let silent = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Unknown)
            .with_last_heartbeat(Some(Utc::now() - chrono::Duration::seconds(120)))
            .with_load(1)
            .build();
        let spare = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Unknown)
            .build();
        store.put_worker(silent.clone());
        store.put_worker(spare.clone());

        let task = TaskBuilder::new().running_on(silent.id).build();
        store.put_task(task.clone());
        ctx.checkpoints
            .save(task.id, silent.id, json!({ "rows": 1000 }), Some("batch-1".to_string()))
            .await
            .unwrap();

        // 健康 -> 降级，不会一步跳到不健康
        let first = ctx.monitor.sweep_once().await.unwrap();
        assert!(first.lost.is_empty());
        assert_eq!(store.worker(silent.id).unwrap().health, WorkerHealth::Degraded);
        assert_eq!(store.task(task.id).unwrap().status, TaskStatus::Running);

        let second = ctx.monitor.sweep_once().await.unwrap();
        assert_eq!(second.lost, vec![silent.id]);
        assert_eq!(store.worker(silent.id).unwrap().health, WorkerHealth::Unhealthy);

        let requeued = store.task(task.id).unwrap();
        assert_eq!(requeued.status, TaskStatus::Ready);
        assert_eq!(requeued.retry_count, 0);

        let events = ctx.registry.events_for(silent.id, 10).await.unwrap();
        assert_eq!(events[0].kind, ConnectivityEventKind::Disconnected);
        assert!(events
            .iter()
            .any(|e| e.kind == ConnectivityEventKind::HeartbeatMissed));

        ctx.scheduler.dispatch_cycle().await.unwrap();
        assert!(
            wait_for(
                || {
                    let store = store.clone();
                    async move {
                        store.task(task.id).map(|t| t.status) == Some(TaskStatus::Completed)
                    }
                },
                Duration::from_secs(2)
            )
            .await
        );
        let (worker_id, request) = transport.dispatched().remove(0);
        assert_eq!(worker_id, spare.id);
        assert_eq!(
            request.checkpoint.map(|c| c.name),
            Some(Some("batch-1".to_string()))
        );
        // Worker记录保留
        assert!(ctx.registry.get(silent.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_recovery_requires_fresh_heartbeat() {
        let store = MockStore::new();
        let transport = MockExecutionTransport::new();
        let ctx = build(&store, &transport);

        let worker = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Unknown)
            .with_health(WorkerHealth::Unhealthy)
            .with_last_heartbeat(Some(Utc::now() - chrono::Duration::seconds(45)))
            .build();
        store.put_worker(worker.clone());

        // 心跳在TTL内但超过一半，不恢复
        ctx.monitor.sweep_once().await.unwrap();
        assert_eq!(store.worker(worker.id).unwrap().health, WorkerHealth::Unhealthy);

        ctx.registry
            .record_heartbeat(worker.id, Utc::now(), None)
            .await
            .unwrap();
        ctx.monitor.sweep_once().await.unwrap();
        assert_eq!(store.worker(worker.id).unwrap().health, WorkerHealth::Healthy);
    }
}
