//! Dispatch loop and outcome handling
//!
//! Assignment is decided by the store through `try_assign`, so concurrent
//! cycles can never double-assign a task or overcommit a worker. Each dispatch
//! runs as its own tokio task and reports back through `handle_success` or
//! `handle_failure`; outcomes from a worker that no longer holds the task are
//! discarded.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use taskmesh_core::{
    config::SchedulerConfig,
    errors::ErrorCategory,
    models::{
        SchedulerSnapshot, Task, TaskStatus, Worker, WorkerHealth, WorkerLoad, WorkerStats,
        WorkerStatus,
    },
    traits::DispatchRequest,
    RetryOutcome, RetryPolicy, SchedulerError, SchedulerResult,
};
use taskmesh_infrastructure::MetricsCollector;

use crate::checkpoint_store::CheckpointStore;
use crate::health_monitor::WorkerLossListener;
use crate::task_graph::TaskGraph;
use crate::transport_router::TransportRouter;
use crate::worker_registry::WorkerRegistry;

const EXECUTION_OPERATION: &str = "task_execution";

/// 一个调度周期的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub promoted: usize,
    pub reclaimed: usize,
    pub assigned: usize,
    /// 没有可用Worker、留待下个周期的任务数
    pub deferred: usize,
    pub degraded: bool,
}

/// 失败回调的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// 按退避重新排队
    Retried { retry_count: i32, delay: Duration },
    /// 从检查点重新分配
    Reassigned,
    /// 存储故障导致未能执行，直接放回队列
    Requeued,
    Failed,
    /// 任务已不由该Worker持有，结果被丢弃
    Stale,
}

struct InFlight {
    worker_id: Uuid,
    token: u64,
    handle: AbortHandle,
}

pub struct Scheduler {
    graph: Arc<TaskGraph>,
    registry: Arc<WorkerRegistry>,
    checkpoints: Arc<CheckpointStore>,
    router: TransportRouter,
    retry: RetryPolicy,
    config: SchedulerConfig,
    metrics: Arc<MetricsCollector>,
    degraded: AtomicBool,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    next_token: AtomicU64,
}

impl Scheduler {
    pub fn new(
        graph: Arc<TaskGraph>,
        registry: Arc<WorkerRegistry>,
        checkpoints: Arc<CheckpointStore>,
        router: TransportRouter,
        retry: RetryPolicy,
        config: SchedulerConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            graph,
            registry,
            checkpoints,
            router,
            retry,
            config,
            metrics,
            degraded: AtomicBool::new(false),
            in_flight: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 存储不可用时为 `true`，此时不会分配新任务
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// 当前在本进程内执行中的任务数
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// 执行一个调度周期
    pub async fn dispatch_cycle(self: &Arc<Self>) -> SchedulerResult<DispatchReport> {
        let started = Instant::now();

        if self.is_degraded() {
            match self.graph.repository().ping().await {
                Ok(()) => {
                    self.degraded.store(false, Ordering::SeqCst);
                    self.metrics.set_degraded(false);
                    info!("权威存储已恢复，恢复任务分配");
                }
                Err(e) => {
                    debug!("存储仍不可用: {}", e);
                    return Ok(DispatchReport {
                        degraded: true,
                        ..Default::default()
                    });
                }
            }
        }

        let result = self.run_cycle().await;
        self.metrics
            .record_dispatch_cycle(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                if report.assigned > 0 || report.promoted > 0 || report.reclaimed > 0 {
                    debug!(
                        "调度周期完成: 晋升 {}, 回收 {}, 分配 {}, 延后 {}",
                        report.promoted, report.reclaimed, report.assigned, report.deferred
                    );
                }
                Ok(report)
            }
            Err(e) => {
                if e.is_store_failure() {
                    self.enter_degraded(&e);
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(self: &Arc<Self>) -> SchedulerResult<DispatchReport> {
        let mut report = DispatchReport {
            promoted: self.graph.promote_ready().await?.len(),
            reclaimed: self.reclaim_lost_work().await?,
            ..Default::default()
        };

        let ready = self.graph.next_ready(self.config.max_dispatch_per_cycle).await?;
        for task in ready {
            let candidates = self
                .registry
                .select_eligible(&task.required_capabilities)
                .await?;

            let mut chosen = None;
            for worker in candidates {
                if self
                    .graph
                    .repository()
                    .try_assign(task.id, worker.id, Utc::now())
                    .await?
                {
                    chosen = Some(worker);
                    break;
                }
            }

            match chosen {
                Some(worker) => {
                    info!(
                        "任务 {} ({}) 分配给Worker {} ({})",
                        task.id, task.task_type, worker.hostname, worker.id
                    );
                    self.metrics
                        .record_task_assigned(&task.task_type, &worker.hostname);
                    self.spawn_execution(task.id, worker);
                    report.assigned += 1;
                }
                None => {
                    debug!("任务 {} 暂无可用Worker，留待下个周期", task.id);
                    report.deferred += 1;
                }
            }
        }
        Ok(report)
    }

    fn spawn_execution(self: &Arc<Self>, task_id: Uuid, worker: Worker) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let worker_id = worker.id;
        let this = Arc::clone(self);

        // 在锁内登记，保证执行结束时的移除一定发生在登记之后
        let mut in_flight = self.lock_in_flight();
        let handle = tokio::spawn(async move {
            this.execute(task_id, worker).await;
            this.finish_in_flight(task_id, token);
        });
        in_flight.insert(
            task_id,
            InFlight {
                worker_id,
                token,
                handle: handle.abort_handle(),
            },
        );
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn execute(&self, task_id: Uuid, worker: Worker) {
        let outcome = match self.prepare_dispatch(task_id, &worker).await {
            Ok(Some(request)) => {
                let transport = self.router.route(&worker);
                debug!("通过 {} 传输下发任务 {}", transport.name(), task_id);
                transport.dispatch(&worker, request).await
            }
            Ok(None) => {
                debug!("任务 {} 已不由Worker {} 持有，放弃执行", task_id, worker.id);
                return;
            }
            Err(e) => Err(e),
        };
        self.persist_outcome(task_id, worker.id, outcome).await;
    }

    /// 读取任务和最新检查点并标记为Running
    async fn prepare_dispatch(
        &self,
        task_id: Uuid,
        worker: &Worker,
    ) -> SchedulerResult<Option<DispatchRequest>> {
        let task = self.graph.get(task_id).await?;
        let checkpoint = match task.checkpoint_ref {
            Some(_) => self.checkpoints.latest(task_id).await?,
            None => None,
        };
        if !self
            .graph
            .repository()
            .mark_running(task_id, worker.id, Utc::now())
            .await?
        {
            return Ok(None);
        }

        Ok(Some(DispatchRequest {
            task_id,
            task_type: task.task_type,
            payload: task.payload,
            attempt: task.retry_count + 1,
            checkpoint,
        }))
    }

    /// 写入执行结果，结果不会被静默丢弃
    ///
    /// 存储故障按退避一直重试。其他错误重试 `max_attempts` 次后改为把任务放回
    /// Ready并释放槽位，放回本身失败时同样按退避重试。任务已不存在时才放弃。
    async fn persist_outcome(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        outcome: SchedulerResult<serde_json::Value>,
    ) {
        let max_attempts = self.retry.config().max_attempts;
        let mut attempt: u32 = 0;
        let mut fallback: Option<SchedulerError> = None;
        loop {
            let applied = match (&fallback, &outcome) {
                (Some(cause), _) => self.requeue_held(task_id, worker_id, cause).await,
                (None, Ok(value)) => self
                    .handle_success(task_id, worker_id, value.clone())
                    .await
                    .map(|_| ()),
                (None, Err(e)) => self.handle_failure(task_id, worker_id, e).await.map(|_| ()),
            };

            let e = match applied {
                Ok(()) => return,
                Err(SchedulerError::TaskNotFound { .. }) => {
                    warn!("任务 {} 已不存在，丢弃Worker {} 的执行结果", task_id, worker_id);
                    return;
                }
                Err(e) => e,
            };

            if e.is_store_failure() {
                self.enter_degraded(&e);
            } else if fallback.is_none() && attempt + 1 >= max_attempts {
                error!(
                    "任务 {} 的执行结果连续 {} 次写入失败，放回队列: {}",
                    task_id, max_attempts, e
                );
                fallback = Some(e);
                attempt = 0;
                continue;
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                "写入任务 {} 的执行结果失败，{:?} 后重试: {}",
                task_id, delay, e
            );
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// 仍由该Worker持有时放回Ready，不计重试
    async fn requeue_held(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        cause: &SchedulerError,
    ) -> SchedulerResult<()> {
        let task = self.graph.get(task_id).await?;
        if !(task.status.holds_worker() && task.assigned_worker_id == Some(worker_id)) {
            return Ok(());
        }
        self.requeue(task, worker_id, cause).await.map(|_| ())
    }

    /// 成功回调；任务已不由该Worker持有时返回 `false`
    pub async fn handle_success(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        result: serde_json::Value,
    ) -> SchedulerResult<bool> {
        let task = self.graph.get(task_id).await?;
        match self.graph.complete_held(task_id, worker_id, result).await? {
            Some(promoted) => {
                let duration = task
                    .started_at
                    .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or(0.0);
                self.metrics
                    .record_task_completed(&task.task_type, duration.max(0.0));
                self.retry.record(EXECUTION_OPERATION, RetryOutcome::Success);
                info!(
                    "任务 {} 在Worker {} 上完成，{} 个依赖任务就绪",
                    task_id,
                    worker_id,
                    promoted.len()
                );
                Ok(true)
            }
            None => {
                debug!("丢弃任务 {} 来自Worker {} 的过期结果", task_id, worker_id);
                Ok(false)
            }
        }
    }

    /// 失败回调
    ///
    /// 可重试错误且未超过重试上限时按退避重新排队，否则标记为Failed；Worker
    /// 失联按检查点重新分配。
    pub async fn handle_failure(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        error: &SchedulerError,
    ) -> SchedulerResult<FailureDisposition> {
        let task = self.graph.get(task_id).await?;
        if !(task.status.holds_worker() && task.assigned_worker_id == Some(worker_id)) {
            debug!("丢弃任务 {} 来自Worker {} 的过期失败", task_id, worker_id);
            return Ok(FailureDisposition::Stale);
        }

        let category = error.category();
        warn!(
            "任务 {} 在Worker {} 上失败 ({}): {}",
            task_id,
            worker_id,
            category.as_str(),
            error
        );

        match category {
            ErrorCategory::WorkerLoss => self.reassign_lost_task(task, worker_id).await,
            ErrorCategory::Store => self.requeue(task, worker_id, error).await,
            ErrorCategory::Transient => self.retry_or_fail(task, worker_id, error, true).await,
            ErrorCategory::Terminal => self.retry_or_fail(task, worker_id, error, false).await,
        }
    }

    async fn retry_or_fail(
        &self,
        mut task: Task,
        worker_id: Uuid,
        error: &SchedulerError,
        retryable: bool,
    ) -> SchedulerResult<FailureDisposition> {
        let now = Utc::now();
        task.assigned_worker_id = None;
        task.error_message = Some(error.to_string());
        task.updated_at = now;

        if retryable && task.can_retry() {
            let delay = self.retry.delay_for(task.retry_count.max(0) as u32);
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            task.started_at = None;
            task.retry_at = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
            if !self.graph.repository().release(&task, worker_id).await? {
                return Ok(FailureDisposition::Stale);
            }
            self.retry.record(EXECUTION_OPERATION, RetryOutcome::Retried);
            self.metrics.record_task_retry(&task.task_type, task.retry_count);
            info!(
                "任务 {} 第 {}/{} 次重试，{:?} 后重新排队",
                task.id, task.retry_count, task.max_retries, delay
            );
            return Ok(FailureDisposition::Retried {
                retry_count: task.retry_count,
                delay,
            });
        }

        task.status = TaskStatus::Failed;
        task.retry_at = None;
        task.completed_at = Some(now);
        if !self.graph.repository().release(&task, worker_id).await? {
            return Ok(FailureDisposition::Stale);
        }
        self.retry.record(EXECUTION_OPERATION, RetryOutcome::Failed);
        self.metrics
            .record_task_failed(&task.task_type, error.category().as_str());
        error!(
            "任务 {} 最终失败 (已重试 {} 次): {}",
            task.id, task.retry_count, error
        );
        Ok(FailureDisposition::Failed)
    }

    /// 任务因存储故障未能执行，放回Ready且不计重试
    async fn requeue(
        &self,
        mut task: Task,
        worker_id: Uuid,
        error: &SchedulerError,
    ) -> SchedulerResult<FailureDisposition> {
        task.status = TaskStatus::Ready;
        task.assigned_worker_id = None;
        task.started_at = None;
        task.error_message = Some(error.to_string());
        task.updated_at = Utc::now();
        if !self.graph.repository().release(&task, worker_id).await? {
            return Ok(FailureDisposition::Stale);
        }
        Ok(FailureDisposition::Requeued)
    }

    /// Worker失联时处理它持有的一个任务
    ///
    /// 有检查点时经WaitingForWorker回到Ready，下一次分配从检查点恢复，不计重试；
    /// 没有检查点时按普通可重试失败处理。
    async fn reassign_lost_task(
        &self,
        mut task: Task,
        worker_id: Uuid,
    ) -> SchedulerResult<FailureDisposition> {
        let Some(checkpoint) = self.checkpoints.latest(task.id).await? else {
            self.metrics.record_task_reassigned(false);
            let lost = SchedulerError::ConnectionReset(format!("Worker {worker_id} 失联"));
            return self.retry_or_fail(task, worker_id, &lost, true).await;
        };

        let now = Utc::now();
        task.status = TaskStatus::WaitingForWorker;
        task.assigned_worker_id = None;
        task.started_at = None;
        task.checkpoint_ref = Some(checkpoint.id);
        task.error_message = Some(format!(
            "Worker {worker_id} 失联，等待从检查点版本 {} 恢复",
            checkpoint.version
        ));
        task.updated_at = now;
        if !self.graph.repository().release(&task, worker_id).await? {
            return Ok(FailureDisposition::Stale);
        }

        // 只在仍处于WaitingForWorker时放回Ready，期间发生的取消不会被覆盖
        let mut waiting = self.graph.get(task.id).await?;
        if waiting.status == TaskStatus::WaitingForWorker {
            waiting.status = TaskStatus::Ready;
            waiting.updated_at = Utc::now();
            let resumed = self
                .graph
                .repository()
                .update_if_status(&waiting, &[TaskStatus::WaitingForWorker])
                .await?;
            if !resumed {
                debug!("任务 {} 在恢复前状态已变化", task.id);
            }
        }

        self.metrics.record_task_reassigned(true);
        info!(
            "任务 {} 将从检查点版本 {} 在其他Worker上恢复",
            task.id, checkpoint.version
        );
        Ok(FailureDisposition::Reassigned)
    }

    /// 处理失联Worker持有的全部任务，返回处理的任务数
    pub async fn handle_worker_loss(&self, worker: &Worker) -> SchedulerResult<usize> {
        let held = self.graph.list_by_worker(worker.id).await?;
        if held.is_empty() {
            return Ok(0);
        }
        warn!(
            "Worker {} ({}) 失联，处理其持有的 {} 个任务",
            worker.hostname,
            worker.id,
            held.len()
        );

        let mut handled = 0;
        for task in held {
            self.abort_in_flight(task.id, Some(worker.id));
            let task_id = task.id;
            match self.reassign_lost_task(task, worker.id).await {
                Ok(FailureDisposition::Stale) => {}
                Ok(_) => handled += 1,
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => error!("重新分配任务 {} 失败: {}", task_id, e),
            }
        }
        Ok(handled)
    }

    /// 回收不健康或已被运维下线的Worker上的任务
    pub async fn reclaim_lost_work(&self) -> SchedulerResult<usize> {
        let lost: Vec<Worker> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|w| {
                w.current_tasks_count > 0
                    && (w.health == WorkerHealth::Unhealthy
                        || matches!(w.status, WorkerStatus::Failed | WorkerStatus::Offline))
            })
            .collect();

        let mut reclaimed = 0;
        for worker in &lost {
            reclaimed += self.handle_worker_loss(worker).await?;
        }
        Ok(reclaimed)
    }

    /// 取消任务；执行中的任务会中止本地下发并通知Worker
    pub async fn cancel_task(&self, task_id: Uuid) -> SchedulerResult<Task> {
        let cancellation = self.graph.cancel(task_id).await?;

        if let Some(worker_id) = cancellation.released_worker {
            self.abort_in_flight(task_id, Some(worker_id));
            match self.registry.get(worker_id).await {
                Ok(worker) => {
                    if let Err(e) = self.router.route(&worker).cancel(&worker, task_id).await {
                        warn!("通知Worker {} 取消任务 {} 失败: {}", worker_id, task_id, e);
                    }
                }
                Err(e) => warn!("取消任务 {} 时读取Worker失败: {}", task_id, e),
            }
        }

        self.metrics.record_task_cancelled();
        Ok(cancellation.task)
    }

    /// 监控快照
    pub async fn snapshot(&self) -> SchedulerResult<SchedulerSnapshot> {
        let counts = self.graph.repository().count_by_status().await?;
        let tasks_by_status: BTreeMap<String, i64> = TaskStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
            .collect();

        let workers = self.registry.list().await?;
        let mut workers_by_status: BTreeMap<String, i64> = WorkerStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut workers_by_health: BTreeMap<String, i64> = WorkerHealth::ALL
            .iter()
            .map(|h| (h.as_str().to_string(), 0))
            .collect();
        for worker in &workers {
            *workers_by_status
                .entry(worker.status.as_str().to_string())
                .or_default() += 1;
            *workers_by_health
                .entry(worker.health.as_str().to_string())
                .or_default() += 1;
        }

        let worker_loads = workers
            .iter()
            .map(|w| WorkerLoad {
                worker_id: w.id,
                hostname: w.hostname.clone(),
                status: w.status.as_str().to_string(),
                health: w.health.as_str().to_string(),
                current_tasks: w.current_tasks_count,
                max_concurrent_tasks: w.max_concurrent_tasks,
            })
            .collect();

        let mut retry_stats = self.retry.stats();
        retry_stats.extend(self.checkpoints.retry_stats());

        Ok(SchedulerSnapshot {
            tasks_by_status,
            workers_by_status,
            workers_by_health,
            worker_loads,
            worker_stats: WorkerStats::from_workers(&workers),
            retry_stats,
            degraded: self.is_degraded(),
        })
    }

    /// 周期调度，收到关闭信号后退出；已下发的任务继续运行至结束
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = Duration::from_millis(self.config.dispatch_interval_ms);
        info!("启动调度循环，周期 {:?}", period);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch_cycle().await {
                        error!("调度周期失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止调度循环");
                    break;
                }
            }
        }
    }

    fn enter_degraded(&self, error: &SchedulerError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            self.metrics.set_degraded(true);
            error!("权威存储不可用，暂停任务分配: {}", error);
        }
    }

    fn abort_in_flight(&self, task_id: Uuid, worker_id: Option<Uuid>) {
        let mut in_flight = self.lock_in_flight();
        let matches = in_flight
            .get(&task_id)
            .map(|entry| worker_id.map(|id| id == entry.worker_id).unwrap_or(true))
            .unwrap_or(false);
        if matches {
            if let Some(entry) = in_flight.remove(&task_id) {
                entry.handle.abort();
                debug!("已中止任务 {} 的本地下发", task_id);
            }
        }
    }

    fn finish_in_flight(&self, task_id: Uuid, token: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(&task_id).map(|e| e.token) == Some(token) {
            in_flight.remove(&task_id);
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WorkerLossListener for Scheduler {
    async fn on_worker_lost(&self, worker: &Worker) -> SchedulerResult<()> {
        self.handle_worker_loss(worker).await.map(|_| ())
    }
}
