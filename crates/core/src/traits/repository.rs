//! 权威存储的仓储接口
//!
//! 任务、Worker、检查点和连接事件各自一个仓储。涉及任务状态和Worker负载的
//! 组合变更（分配、完成、释放）必须在同一事务中完成，因此由 `TaskRepository`
//! 提供原子操作；`WorkerRepository::update` 不会改写 `current_tasks_count`。
//! 心跳、健康评估和状态变更只写各自的列，并发写入互不覆盖。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        Checkpoint, ConnectivityEvent, NewCheckpoint, Task, TaskStatus, Worker, WorkerHealth,
        WorkerMetrics, WorkerStatus,
    },
    SchedulerResult,
};

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    /// 在一个事务中写入一批任务
    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<()>;

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>>;

    async fn get_by_ids(&self, ids: &[Uuid]) -> SchedulerResult<Vec<Task>>;

    /// 仅当存储中的状态属于 `expected` 时写回整条记录
    ///
    /// 状态已被并发修改时返回 `false`，不做任何修改。
    async fn update_if_status(&self, task: &Task, expected: &[TaskStatus])
        -> SchedulerResult<bool>;

    async fn list_all(&self) -> SchedulerResult<Vec<Task>>;

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>>;

    /// 当前由指定Worker持有（Assigned/Running）的任务
    async fn list_by_worker(&self, worker_id: Uuid) -> SchedulerResult<Vec<Task>>;

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, i64>>;

    /// 将依赖全部完成且退避已到期的Pending任务晋升为Ready
    ///
    /// 返回被晋升的任务ID。
    async fn promote_ready(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Uuid>>;

    /// 原子地把Ready任务分配给Worker并增加其负载
    ///
    /// 任务不再是Ready，或Worker不是Active/Healthy，或Worker已满载时返回 `false`，
    /// 不做任何修改。
    async fn try_assign(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// Assigned -> Running，仅当任务仍由该Worker持有
    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 原子地完成任务、释放Worker负载并晋升依赖它的任务
    ///
    /// 指定 `worker_id` 时只有任务仍由该Worker持有才会生效；任务已是终态或
    /// 持有者不符时返回 `None`。
    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Vec<Uuid>>>;

    /// 原子地写回任务记录并释放 `worker_id` 的一个负载槽位
    ///
    /// 仅当存储中的任务仍由该Worker持有时生效，否则返回 `false`。
    async fn release(&self, task: &Task, worker_id: Uuid) -> SchedulerResult<bool>;

    async fn set_checkpoint_ref(&self, task_id: Uuid, checkpoint_id: Uuid)
        -> SchedulerResult<()>;

    /// 存储连通性检查
    async fn ping(&self) -> SchedulerResult<()>;
}

/// Worker仓储
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    async fn create(&self, worker: &Worker) -> SchedulerResult<()>;

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Worker>>;

    async fn find_by_hostname(&self, hostname: &str) -> SchedulerResult<Option<Worker>>;

    /// 更新Worker记录，不修改 `current_tasks_count`
    async fn update(&self, worker: &Worker) -> SchedulerResult<()>;

    /// 写入心跳
    ///
    /// `last_heartbeat` 只前进不后退；`metrics` 为空时保留原值；`degrade` 为真时
    /// 只有当前为Healthy的Worker会降为Degraded。Worker不存在时返回 `false`。
    async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        metrics: Option<&WorkerMetrics>,
        degrade: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 只修改健康状态和连续探测失败次数
    async fn update_health(
        &self,
        id: Uuid,
        health: WorkerHealth,
        consecutive_failures: i32,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 只修改管理状态
    async fn update_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn list(&self) -> SchedulerResult<Vec<Worker>>;

    async fn delete(&self, id: Uuid) -> SchedulerResult<bool>;
}

/// 检查点仓储，只追加
#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// 追加检查点
    ///
    /// 未指定版本时分配 `max(version) + 1`；指定的版本不高于当前最新版本时返回
    /// `StaleCheckpoint`。
    async fn append(&self, checkpoint: &NewCheckpoint) -> SchedulerResult<Checkpoint>;

    async fn latest(&self, task_id: Uuid) -> SchedulerResult<Option<Checkpoint>>;

    /// 按版本升序
    async fn list_for_task(&self, task_id: Uuid) -> SchedulerResult<Vec<Checkpoint>>;
}

/// 连接事件仓储，只追加
#[async_trait]
pub trait ConnectivityEventRepository: Send + Sync {
    async fn record(&self, event: &ConnectivityEvent) -> SchedulerResult<()>;

    /// 最新的事件在前
    async fn list_for_worker(
        &self,
        worker_id: Uuid,
        limit: i64,
    ) -> SchedulerResult<Vec<ConnectivityEvent>>;
}
