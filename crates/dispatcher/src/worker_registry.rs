use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskmesh_core::{
    config::HealthConfig,
    models::{
        ConnectivityEvent, ConnectivityEventKind, Worker, WorkerHealth, WorkerMetrics,
        WorkerRegistration, WorkerStats, WorkerStatus,
    },
    traits::{ConnectivityEventRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};
use taskmesh_infrastructure::MetricsCollector;

/// Worker注册表
///
/// 维护Worker记录和健康状态。Worker只会被显式注销，心跳丢失不会删除记录。
pub struct WorkerRegistry {
    worker_repo: Arc<dyn WorkerRepository>,
    event_repo: Arc<dyn ConnectivityEventRepository>,
    heartbeat_ttl: Duration,
    pressure_threshold: f64,
    metrics: Arc<MetricsCollector>,
}

impl WorkerRegistry {
    pub fn new(
        worker_repo: Arc<dyn WorkerRepository>,
        event_repo: Arc<dyn ConnectivityEventRepository>,
        config: &HealthConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            worker_repo,
            event_repo,
            heartbeat_ttl: Duration::seconds(config.heartbeat_ttl_seconds as i64),
            pressure_threshold: config.resource_pressure_threshold,
            metrics,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    pub fn pressure_threshold(&self) -> f64 {
        self.pressure_threshold
    }

    /// 注册Worker
    ///
    /// 主机名已存在时更新原记录并保留ID、当前负载和历史事件；新Worker的健康
    /// 状态为Unknown，直到首次探测成功。
    #[instrument(skip(self, registration), fields(hostname = %registration.hostname))]
    pub async fn register(&self, registration: WorkerRegistration) -> SchedulerResult<Worker> {
        registration.validate()?;
        let now = Utc::now();

        if let Some(mut existing) = self
            .worker_repo
            .find_by_hostname(&registration.hostname)
            .await?
        {
            existing.transport = registration.transport;
            existing.capabilities = registration.capabilities;
            existing.resources = registration.resources;
            existing.max_concurrent_tasks = registration.max_concurrent_tasks;
            existing.health = WorkerHealth::Unknown;
            existing.consecutive_probe_failures = 0;
            existing.last_heartbeat = Some(now);
            existing.updated_at = now;
            self.worker_repo.update(&existing).await?;

            self.record_event(
                existing.id,
                ConnectivityEventKind::Reconnected,
                json!({ "reason": "re-registration" }),
            )
            .await;
            info!("Worker重新注册: {} ({})", existing.hostname, existing.id);
            return self.get(existing.id).await;
        }

        let worker = registration.into_worker(now);
        self.worker_repo.create(&worker).await?;
        self.record_event(
            worker.id,
            ConnectivityEventKind::Connected,
            json!({
                "address": worker.transport.address,
                "capabilities": worker.capabilities,
            }),
        )
        .await;
        info!("Worker注册成功: {} ({})", worker.hostname, worker.id);
        Ok(worker)
    }

    /// 记录心跳
    ///
    /// 与上次心跳的间隔超过TTL一半，或上报的资源使用率超过阈值时，Healthy
    /// 降为Degraded。早于已记录时间的心跳不会让时间戳倒退。心跳只写自己的
    /// 列，不会覆盖并发写入的健康评估。
    pub async fn record_heartbeat(
        &self,
        worker_id: Uuid,
        at: DateTime<Utc>,
        metrics: Option<WorkerMetrics>,
    ) -> SchedulerResult<Worker> {
        let before = self.get(worker_id).await?;
        let gap = before.last_heartbeat.map(|previous| at - previous);
        let half_ttl = self.heartbeat_ttl / 2;
        let late = gap.map(|g| g > half_ttl).unwrap_or(true);
        let pressure = metrics
            .as_ref()
            .map(|m| m.under_pressure(self.pressure_threshold))
            .unwrap_or(false);

        let reconnected = before.health == WorkerHealth::Unhealthy
            || gap.map(|g| g > self.heartbeat_ttl).unwrap_or(true);
        if reconnected {
            self.record_event(
                worker_id,
                ConnectivityEventKind::Reconnected,
                json!({ "gap_seconds": gap.map(|g| g.num_seconds()) }),
            )
            .await;
        }

        let written = self
            .worker_repo
            .record_heartbeat(worker_id, at, metrics.as_ref(), late || pressure, Utc::now())
            .await?;
        if !written {
            return Err(SchedulerError::WorkerNotFound { id: worker_id });
        }

        let worker = self.get(worker_id).await?;
        if before.health == WorkerHealth::Healthy && worker.health == WorkerHealth::Degraded {
            self.metrics
                .record_health_transition(WorkerHealth::Healthy, WorkerHealth::Degraded);
            warn!(
                "Worker {} 降级: 心跳间隔 {:?} 秒, 资源压力 {}",
                worker_id,
                gap.map(|g| g.num_seconds()),
                pressure
            );
        }
        debug!("收到Worker {} 心跳", worker_id);
        Ok(worker)
    }

    /// 可接收任务的Worker，按当前负载升序
    ///
    /// 负载相同时剩余容量大的在前，再按ID排序保证结果稳定。
    pub async fn select_eligible(&self, required: &[String]) -> SchedulerResult<Vec<Worker>> {
        let mut eligible: Vec<Worker> = self
            .worker_repo
            .list()
            .await?
            .into_iter()
            .filter(|w| w.is_eligible() && w.has_capabilities(required))
            .collect();

        eligible.sort_by(|a, b| {
            a.current_tasks_count
                .cmp(&b.current_tasks_count)
                .then(b.remaining_capacity().cmp(&a.remaining_capacity()))
                .then(a.id.cmp(&b.id))
        });
        Ok(eligible)
    }

    /// 显式注销；仍持有任务的Worker不能注销
    pub async fn deregister(&self, worker_id: Uuid) -> SchedulerResult<()> {
        let worker = self.get(worker_id).await?;
        if worker.current_tasks_count > 0 {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "Worker {} 仍有 {} 个任务在执行",
                worker_id, worker.current_tasks_count
            )));
        }
        if !self.worker_repo.delete(worker_id).await? {
            return Err(SchedulerError::WorkerNotFound { id: worker_id });
        }
        info!("Worker已注销: {} ({})", worker.hostname, worker_id);
        Ok(())
    }

    pub async fn get(&self, worker_id: Uuid) -> SchedulerResult<Worker> {
        self.worker_repo
            .get_by_id(worker_id)
            .await?
            .ok_or(SchedulerError::WorkerNotFound { id: worker_id })
    }

    pub async fn list(&self) -> SchedulerResult<Vec<Worker>> {
        self.worker_repo.list().await
    }

    /// 运维修改管理状态
    pub async fn set_status(&self, worker_id: Uuid, status: WorkerStatus) -> SchedulerResult<Worker> {
        let worker = self.get(worker_id).await?;
        if worker.status == status {
            return Ok(worker);
        }
        if !self
            .worker_repo
            .update_status(worker_id, status, Utc::now())
            .await?
        {
            return Err(SchedulerError::WorkerNotFound { id: worker_id });
        }
        info!("Worker {} 状态变更: {} -> {}", worker_id, worker.status, status);
        self.get(worker_id).await
    }

    /// 写入一次健康评估的结果
    ///
    /// 只修改健康字段，探测期间到达的心跳和资源指标保持不变。
    pub async fn apply_health(
        &self,
        worker_id: Uuid,
        health: WorkerHealth,
        consecutive_failures: i32,
    ) -> SchedulerResult<Worker> {
        let previous = self.get(worker_id).await?.health;
        if !self
            .worker_repo
            .update_health(worker_id, health, consecutive_failures, Utc::now())
            .await?
        {
            return Err(SchedulerError::WorkerNotFound { id: worker_id });
        }

        if previous != health {
            self.metrics.record_health_transition(previous, health);
            info!("Worker {} 健康状态: {} -> {}", worker_id, previous, health);
        }
        self.get(worker_id).await
    }

    pub async fn stats(&self) -> SchedulerResult<WorkerStats> {
        let workers = self.worker_repo.list().await?;
        let stats = WorkerStats::from_workers(&workers);
        self.metrics.update_worker_stats(&stats);
        Ok(stats)
    }

    pub async fn events_for(
        &self,
        worker_id: Uuid,
        limit: i64,
    ) -> SchedulerResult<Vec<ConnectivityEvent>> {
        self.event_repo.list_for_worker(worker_id, limit).await
    }

    /// 追加连接事件；写入失败只记录日志
    pub async fn record_event(
        &self,
        worker_id: Uuid,
        kind: ConnectivityEventKind,
        data: serde_json::Value,
    ) {
        let event = ConnectivityEvent::new(worker_id, kind, data);
        if let Err(e) = self.event_repo.record(&event).await {
            warn!("记录Worker {} 的 {} 事件失败: {}", worker_id, kind, e);
        }
    }
}
