use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use taskmesh_core::AppConfig;
use taskmesh_dispatcher::{DispatcherContext, Repositories, TransportRouter};
use taskmesh_infrastructure::{HttpExecutionTransport, SqliteStore};
use tracing::{info, warn};

use crate::shutdown::{drain, ShutdownManager};

/// 后台循环和在途任务的关闭宽限期
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 主应用程序：权威存储加上组装好的调度子系统
pub struct Application {
    config: AppConfig,
    store: SqliteStore,
    context: DispatcherContext,
}

impl Application {
    /// 使用HTTP执行传输创建应用
    pub async fn new(config: AppConfig) -> Result<Self> {
        let transport = Arc::new(HttpExecutionTransport::new(Duration::from_secs(
            config.scheduler.execution_timeout_seconds,
        )));
        Self::with_router(config, TransportRouter::new(transport)).await
    }

    /// 使用自定义传输路由创建应用
    pub async fn with_router(config: AppConfig, router: TransportRouter) -> Result<Self> {
        info!("初始化应用程序");

        let store = SqliteStore::connect(&config.database)
            .await
            .context("连接权威存储失败")?;

        let repositories = Repositories {
            tasks: store.task_repository(),
            workers: store.worker_repository(),
            checkpoints: store.checkpoint_repository(),
            events: store.connectivity_repository(),
        };
        let context = DispatcherContext::build(repositories, &config, router, None);

        Ok(Self {
            config,
            store,
            context,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn context(&self) -> &DispatcherContext {
        &self.context
    }

    /// 运行调度循环和健康巡检，直到收到关闭信号
    pub async fn run(&self, shutdown: ShutdownManager) -> Result<()> {
        // 进程停机期间失联的Worker上可能还挂着任务
        match self.context.scheduler.reclaim_lost_work().await {
            Ok(0) => {}
            Ok(count) => info!("启动时回收了 {} 个失联Worker上的任务", count),
            Err(e) => warn!("启动时回收任务失败: {}", e),
        }

        let scheduler = tokio::spawn(
            Arc::clone(&self.context.scheduler).run(shutdown.subscribe().await),
        );
        let monitor = tokio::spawn(
            Arc::clone(&self.context.monitor).run(shutdown.subscribe().await),
        );
        info!("调度子系统已启动");

        shutdown.wait_for_shutdown().await;
        info!("开始优雅关闭");

        let aborted = drain(
            vec![("scheduler", scheduler), ("health_monitor", monitor)],
            SHUTDOWN_GRACE,
        )
        .await;
        if aborted > 0 {
            warn!("{} 个后台组件被强制中止", aborted);
        }

        self.wait_for_in_flight(SHUTDOWN_GRACE).await;
        self.store.close().await;

        info!("应用已关闭");
        Ok(())
    }

    /// 已下发的任务不中止，等待其结果落库后再关闭存储
    async fn wait_for_in_flight(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.context.scheduler.in_flight_count();
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("仍有 {} 个任务在执行，不再等待", remaining);
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
