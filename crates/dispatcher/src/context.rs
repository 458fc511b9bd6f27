use std::sync::Arc;
use std::time::Duration;

use taskmesh_core::{
    traits::{
        CheckpointRepository, ConnectivityEventRepository, RpcHealthClient, TaskRepository,
        WorkerRepository,
    },
    AppConfig, RetryPolicy,
};
use taskmesh_infrastructure::{MetricsCollector, TimeoutConfig, TimeoutHandler};

use crate::checkpoint_store::CheckpointStore;
use crate::health_checker::HealthChecker;
use crate::health_monitor::{HealthMonitor, WorkerLossListener};
use crate::scheduler::Scheduler;
use crate::task_graph::TaskGraph;
use crate::transport_router::TransportRouter;
use crate::worker_registry::WorkerRegistry;

/// 权威存储的四个仓储
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub events: Arc<dyn ConnectivityEventRepository>,
}

/// 组装好的调度子系统
///
/// 所有组件显式构造并共享同一组仓储，生命周期由进程入口持有。
pub struct DispatcherContext {
    pub graph: Arc<TaskGraph>,
    pub registry: Arc<WorkerRegistry>,
    pub checkpoints: Arc<CheckpointStore>,
    pub scheduler: Arc<Scheduler>,
    pub monitor: Arc<HealthMonitor>,
    pub metrics: Arc<MetricsCollector>,
}

impl DispatcherContext {
    pub fn build(
        repositories: Repositories,
        config: &AppConfig,
        router: TransportRouter,
        rpc_client: Option<Arc<dyn RpcHealthClient>>,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let retry = RetryPolicy::new(Some(config.retry.clone()));
        let timeout = TimeoutHandler::new(TimeoutConfig::from_configs(
            &config.health,
            &config.checkpoint,
        ));

        let graph = Arc::new(TaskGraph::new(
            Arc::clone(&repositories.tasks),
            Arc::clone(&metrics),
            config.scheduler.validate_cycles_on_submit,
        ));
        let registry = Arc::new(WorkerRegistry::new(
            repositories.workers,
            repositories.events,
            &config.health,
            Arc::clone(&metrics),
        ));

        // 检查点写入使用独立的尝试次数
        let mut checkpoint_retry_config = config.retry.clone();
        checkpoint_retry_config.max_attempts = config.checkpoint.save_attempts;
        let checkpoints = Arc::new(CheckpointStore::new(
            repositories.checkpoints,
            repositories.tasks,
            RetryPolicy::new(Some(checkpoint_retry_config)),
            timeout.clone(),
            Arc::clone(&metrics),
        ));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&graph),
            Arc::clone(&registry),
            Arc::clone(&checkpoints),
            router,
            retry,
            config.scheduler.clone(),
            Arc::clone(&metrics),
        ));

        let checker = Arc::new(HealthChecker::new(
            &config.health,
            timeout,
            rpc_client,
            Arc::clone(&metrics),
        ));
        let listener: Arc<dyn WorkerLossListener> = scheduler.clone();
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            checker,
            Duration::from_secs(config.health.sweep_interval_seconds),
            Some(listener),
        ));

        Self {
            graph,
            registry,
            checkpoints,
            scheduler,
            monitor,
            metrics,
        }
    }
}
