//! Task records, dependency readiness and dispatch ordering
//!
//! Every state change goes through the authoritative store. Completion and the
//! promotion of the dependents it unblocks happen in one store operation, so a
//! dependent is never observed Ready before the completion that satisfies it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskmesh_core::{
    models::{dispatch_order, Task, TaskStatus},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};
use taskmesh_infrastructure::MetricsCollector;

use crate::dependency_checker::DependencyChecker;
use crate::task_split::SplitStrategy;

/// 取消结果
#[derive(Debug, Clone)]
pub struct Cancellation {
    pub task: Task,
    /// 被释放负载槽位的Worker
    pub released_worker: Option<Uuid>,
}

pub struct TaskGraph {
    task_repo: Arc<dyn TaskRepository>,
    dependency_checker: DependencyChecker,
    metrics: Arc<MetricsCollector>,
    validate_cycles_on_submit: bool,
}

impl TaskGraph {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        metrics: Arc<MetricsCollector>,
        validate_cycles_on_submit: bool,
    ) -> Self {
        Self {
            dependency_checker: DependencyChecker::new(Arc::clone(&task_repo)),
            task_repo,
            metrics,
            validate_cycles_on_submit,
        }
    }

    /// 提交单个任务
    ///
    /// 依赖必须已存在且不能包含自身。依赖已全部完成时直接进入Ready。
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn submit(&self, mut task: Task) -> SchedulerResult<Task> {
        task.validate()?;
        self.dependency_checker
            .validate_dependencies(&task, &HashSet::new())
            .await?;

        task.status = self.initial_status(&task).await?;
        task.assigned_worker_id = None;
        task.updated_at = Utc::now();

        let created = self.task_repo.create(&task).await?;
        self.metrics.record_task_submitted(1);
        info!("任务已提交: {} ({})", created.id, created.status);
        Ok(created)
    }

    /// 批量提交，依赖可以指向同一批次内的任务
    ///
    /// 整批在一个事务中写入；开启循环检测时，合并后的依赖图有环则整批拒绝。
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> SchedulerResult<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let batch_ids: HashSet<Uuid> = tasks.iter().map(|t| t.id).collect();
        if batch_ids.len() != tasks.len() {
            return Err(SchedulerError::InvalidTaskParams(
                "批次内存在重复的任务ID".to_string(),
            ));
        }
        for task in &tasks {
            task.validate()?;
            self.dependency_checker
                .validate_dependencies(task, &batch_ids)
                .await?;
        }
        if self.validate_cycles_on_submit {
            self.dependency_checker.validate_acyclic(&tasks).await?;
        }

        let now = Utc::now();
        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|mut task| {
                task.status = TaskStatus::Pending;
                task.assigned_worker_id = None;
                task.updated_at = now;
                task
            })
            .collect();

        self.task_repo.create_batch(&tasks).await?;
        let promoted = self.task_repo.promote_ready(now).await?;
        self.metrics.record_task_submitted(tasks.len() as u64);
        info!(
            "批量提交 {} 个任务，其中 {} 个立即就绪",
            tasks.len(),
            promoted.len()
        );

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        self.task_repo.get_by_ids(&ids).await
    }

    async fn initial_status(&self, task: &Task) -> SchedulerResult<TaskStatus> {
        if task.dependencies.is_empty() {
            return Ok(TaskStatus::Ready);
        }
        let dependencies = self.task_repo.get_by_ids(&task.dependencies).await?;
        let all_completed = dependencies.len() == task.dependencies.len()
            && dependencies.iter().all(|d| d.status == TaskStatus::Completed);
        Ok(if all_completed {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        })
    }

    /// 标记完成并晋升依赖它的任务，返回被晋升的任务
    pub async fn mark_completed(&self, task_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        match self
            .task_repo
            .complete(task_id, None, None, Utc::now())
            .await?
        {
            Some(promoted) => {
                debug!("任务 {} 完成，{} 个任务就绪", task_id, promoted.len());
                Ok(promoted)
            }
            None => Err(SchedulerError::InvalidStateTransition(format!(
                "任务 {task_id} 已处于终态"
            ))),
        }
    }

    /// Worker上报成功；任务已不由该Worker持有时返回 `None`
    pub async fn complete_held(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        result: serde_json::Value,
    ) -> SchedulerResult<Option<Vec<Uuid>>> {
        self.task_repo
            .complete(task_id, Some(worker_id), Some(result), Utc::now())
            .await
    }

    /// 按调度顺序返回Ready任务
    pub async fn next_ready(&self, limit: usize) -> SchedulerResult<Vec<Task>> {
        let mut ready = self.task_repo.list_by_status(TaskStatus::Ready).await?;
        ready.sort_by(dispatch_order);
        self.metrics.update_ready_queue_depth(ready.len());
        ready.truncate(limit);
        Ok(ready)
    }

    /// 晋升依赖已满足、退避已到期的Pending任务
    pub async fn promote_ready(&self) -> SchedulerResult<Vec<Uuid>> {
        self.task_repo.promote_ready(Utc::now()).await
    }

    /// 对存储中的任务加上候选任务做完整的环检测
    pub async fn validate_acyclic(&self, candidates: &[Task]) -> SchedulerResult<()> {
        self.dependency_checker.validate_acyclic(candidates).await
    }

    pub async fn dependency_closure(&self, task_id: Uuid) -> SchedulerResult<Vec<Uuid>> {
        self.dependency_checker.transitive_dependencies(task_id).await
    }

    pub async fn get(&self, task_id: Uuid) -> SchedulerResult<Task> {
        self.task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })
    }

    pub async fn list_by_worker(&self, worker_id: Uuid) -> SchedulerResult<Vec<Task>> {
        self.task_repo.list_by_worker(worker_id).await
    }

    /// 管理员取消
    ///
    /// 未分配的任务直接移出调度队列；已分配或运行中的任务同时释放Worker槽位。
    pub async fn cancel(&self, task_id: Uuid) -> SchedulerResult<Cancellation> {
        loop {
            let mut task = self.get(task_id).await?;
            if task.status.is_terminal() {
                return Err(SchedulerError::InvalidStateTransition(format!(
                    "任务 {} 已处于终态 {}",
                    task_id, task.status
                )));
            }

            let now = Utc::now();
            let holder = task.assigned_worker_id.filter(|_| task.status.holds_worker());
            task.status = TaskStatus::Cancelled;
            task.assigned_worker_id = None;
            task.retry_at = None;
            task.error_message = Some("任务已被取消".to_string());
            task.completed_at = Some(now);
            task.updated_at = now;

            match holder {
                Some(worker_id) => {
                    if self.task_repo.release(&task, worker_id).await? {
                        info!("已取消运行中的任务 {}，释放Worker {}", task_id, worker_id);
                        return Ok(Cancellation {
                            task,
                            released_worker: Some(worker_id),
                        });
                    }
                    // 持有者在读取后发生了变化，重新读取
                    warn!("取消任务 {} 时持有者已变化，重试", task_id);
                }
                None => {
                    if self
                        .task_repo
                        .update_if_status(&task, &TaskStatus::UNHELD)
                        .await?
                    {
                        info!("已取消任务 {}", task_id);
                        return Ok(Cancellation {
                            task,
                            released_worker: None,
                        });
                    }
                    // 读取后任务被分配或结束，重新读取后走对应路径
                    warn!("取消任务 {} 时状态已变化，重试", task_id);
                }
            }
        }
    }

    /// 把尚未分配的任务拆分为子任务
    ///
    /// 子任务继承父任务的类型、优先级、关键程度、能力要求、重试上限和依赖，
    /// 父任务改为依赖全部子任务并回到Pending，子任务全部完成后才会被调度。
    /// 先挂起父任务再写入子任务，写入失败时恢复父任务原来的依赖。
    #[instrument(skip(self, strategy))]
    pub async fn split(
        &self,
        parent_id: Uuid,
        strategy: &dyn SplitStrategy,
    ) -> SchedulerResult<Vec<Task>> {
        let parent = self.get(parent_id).await?;
        if !matches!(parent.status, TaskStatus::Pending | TaskStatus::Ready) {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "任务 {} 处于 {}，不能拆分",
                parent_id, parent.status
            )));
        }

        let specs = strategy.subtasks(&parent)?;
        if specs.is_empty() {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "任务 {parent_id} 的拆分策略没有产生子任务"
            )));
        }

        let mut subtasks: Vec<Task> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let mut subtask = Task::new(parent.task_type.clone(), spec.payload)
                .with_priority(parent.priority);
            subtask.criticality = parent.criticality;
            subtask.required_capabilities = parent.required_capabilities.clone();
            subtask.max_retries = parent.max_retries;
            subtask.dependencies = parent.dependencies.clone();
            for earlier in spec.depends_on {
                let Some(dependency) = subtasks.get(earlier) else {
                    return Err(SchedulerError::InvalidTaskParams(format!(
                        "子任务 {index} 只能依赖排在前面的子任务，不能依赖 {earlier}"
                    )));
                };
                subtask.dependencies.push(dependency.id);
            }
            subtasks.push(subtask);
        }

        let mut gated = parent.clone();
        gated.dependencies.extend(subtasks.iter().map(|t| t.id));
        gated.status = TaskStatus::Pending;
        gated.updated_at = Utc::now();
        if !self
            .task_repo
            .update_if_status(&gated, &[TaskStatus::Pending, TaskStatus::Ready])
            .await?
        {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "任务 {parent_id} 在拆分期间已被分配或结束"
            )));
        }

        let created = match self.submit_batch(subtasks).await {
            Ok(created) => created,
            Err(e) => {
                let restored = self
                    .task_repo
                    .update_if_status(&parent, &[TaskStatus::Pending])
                    .await;
                if !matches!(restored, Ok(true)) {
                    warn!("拆分失败后恢复任务 {} 未成功", parent_id);
                }
                return Err(e);
            }
        };

        info!("任务 {} 拆分为 {} 个子任务", parent_id, created.len());
        Ok(created)
    }

    /// 任务进度估计（0-100）
    pub async fn progress(&self, task_id: Uuid) -> SchedulerResult<f64> {
        Ok(self.get(task_id).await?.progress(Utc::now()))
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.task_repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_split::{ArraySplit, SubtaskSpec};
    use taskmesh_core::models::Criticality;
    use taskmesh_testing_utils::{MockStore, TaskBuilder, WorkerBuilder};

    fn graph(store: &MockStore) -> TaskGraph {
        TaskGraph::new(store.task_repository(), Arc::new(MetricsCollector::new()), true)
    }

    #[tokio::test]
    async fn test_submit_rejects_self_dependency() {
        let store = MockStore::new();
        let graph = graph(&store);
        let id = Uuid::new_v4();
        let task = TaskBuilder::new().with_id(id).with_dependencies(vec![id]).build();

        let result = graph.submit(task).await;
        assert!(matches!(result, Err(SchedulerError::SelfDependency { .. })));
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_dependency() {
        let store = MockStore::new();
        let graph = graph(&store);
        let task = TaskBuilder::new()
            .with_dependencies(vec![Uuid::new_v4()])
            .build();

        let result = graph.submit(task).await;
        assert!(matches!(result, Err(SchedulerError::UnknownDependency { .. })));
    }

    #[tokio::test]
    async fn test_dependent_waits_for_completion() {
        let store = MockStore::new();
        let graph = graph(&store);

        let a = graph.submit(TaskBuilder::new().build()).await.unwrap();
        let b = graph
            .submit(TaskBuilder::new().with_dependencies(vec![a.id]).build())
            .await
            .unwrap();
        assert_eq!(a.status, TaskStatus::Ready);
        assert_eq!(b.status, TaskStatus::Pending);

        let ready: Vec<Uuid> = graph.next_ready(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![a.id]);

        let promoted = graph.mark_completed(a.id).await.unwrap();
        assert_eq!(promoted, vec![b.id]);
        assert_eq!(graph.get(b.id).await.unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_submit_after_dependency_completed_is_ready() {
        let store = MockStore::new();
        let graph = graph(&store);
        let a = graph.submit(TaskBuilder::new().build()).await.unwrap();
        graph.mark_completed(a.id).await.unwrap();

        let b = graph
            .submit(TaskBuilder::new().with_dependencies(vec![a.id]).build())
            .await
            .unwrap();
        assert_eq!(b.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_next_ready_ordering() {
        let store = MockStore::new();
        let graph = graph(&store);
        let base = Utc::now();

        let normal_first = TaskBuilder::new()
            .with_priority(1)
            .with_created_at(base)
            .build();
        let normal_later = TaskBuilder::new()
            .with_priority(1)
            .with_created_at(base + chrono::Duration::seconds(1))
            .build();
        let normal_urgent = TaskBuilder::new().with_priority(0).build();
        let critical = TaskBuilder::new()
            .with_priority(50)
            .with_criticality(Criticality::Critical)
            .build();

        for task in [&normal_later, &normal_first, &normal_urgent, &critical] {
            graph.submit(task.clone()).await.unwrap();
        }

        let order: Vec<Uuid> = graph.next_ready(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(
            order,
            vec![critical.id, normal_urgent.id, normal_first.id, normal_later.id]
        );
    }

    #[tokio::test]
    async fn test_batch_with_internal_dependencies() {
        let store = MockStore::new();
        let graph = graph(&store);
        let a = TaskBuilder::new().build();
        let b = TaskBuilder::new().with_dependencies(vec![a.id]).build();

        let created = graph.submit_batch(vec![b.clone(), a.clone()]).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(graph.get(a.id).await.unwrap().status, TaskStatus::Ready);
        assert_eq!(graph.get(b.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_batch_with_cycle_rejected() {
        let store = MockStore::new();
        let graph = graph(&store);
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();
        let a = TaskBuilder::new().with_id(a_id).with_dependencies(vec![b_id]).build();
        let b = TaskBuilder::new().with_id(b_id).with_dependencies(vec![a_id]).build();

        let result = graph.submit_batch(vec![a, b]).await;
        match result {
            Err(SchedulerError::CircularDependency { tasks }) => {
                assert!(tasks.contains(&a_id) && tasks.contains(&b_id));
            }
            other => panic!("expected cycle rejection, got {other:?}"),
        }
        assert!(store.task(a_id).is_none());
    }

    #[tokio::test]
    async fn test_dependency_closure() {
        let store = MockStore::new();
        let graph = graph(&store);
        let a = graph.submit(TaskBuilder::new().build()).await.unwrap();
        let b = graph
            .submit(TaskBuilder::new().with_dependencies(vec![a.id]).build())
            .await
            .unwrap();
        let c = graph
            .submit(TaskBuilder::new().with_dependencies(vec![b.id]).build())
            .await
            .unwrap();

        assert_eq!(graph.dependency_closure(c.id).await.unwrap(), vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_cancel_ready_and_running() {
        let store = MockStore::new();
        let graph = graph(&store);

        let ready = graph.submit(TaskBuilder::new().build()).await.unwrap();
        let cancelled = graph.cancel(ready.id).await.unwrap();
        assert_eq!(cancelled.task.status, TaskStatus::Cancelled);
        assert!(cancelled.released_worker.is_none());
        assert!(graph.next_ready(10).await.unwrap().is_empty());

        let worker = WorkerBuilder::new().with_load(1).build();
        store.put_worker(worker.clone());
        let running = TaskBuilder::new().running_on(worker.id).build();
        store.put_task(running.clone());

        let cancelled = graph.cancel(running.id).await.unwrap();
        assert_eq!(cancelled.released_worker, Some(worker.id));
        assert_eq!(store.worker(worker.id).unwrap().current_tasks_count, 0);

        assert!(matches!(
            graph.cancel(running.id).await,
            Err(SchedulerError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_racing_assignment_releases_slot() {
        let store = MockStore::new();
        let graph = graph(&store);
        let worker = WorkerBuilder::new().with_capacity(1).build();
        store.put_worker(worker.clone());
        let task = graph.submit(TaskBuilder::new().build()).await.unwrap();

        // 取消读取到Ready之后，调度循环把任务分配给了Worker
        let (task_id, worker_id) = (task.id, worker.id);
        store.on_next_task_read(move |store| {
            let mut assigned = store.task(task_id).unwrap();
            assigned.status = TaskStatus::Assigned;
            assigned.assigned_worker_id = Some(worker_id);
            store.put_task(assigned);
            let mut busy = store.worker(worker_id).unwrap();
            busy.current_tasks_count += 1;
            store.put_worker(busy);
        });

        let cancelled = graph.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.released_worker, Some(worker.id));

        let stored = store.task(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.assigned_worker_id.is_none());
        assert_eq!(store.worker(worker.id).unwrap().current_tasks_count, 0);
    }

    #[tokio::test]
    async fn test_split_gates_parent_on_subtasks() {
        let store = MockStore::new();
        let graph = graph(&store);
        let parent = graph
            .submit(
                TaskBuilder::new()
                    .with_payload(serde_json::json!({ "shards": [1, 2, 3, 4, 5] }))
                    .with_priority(7)
                    .with_criticality(Criticality::High)
                    .build(),
            )
            .await
            .unwrap();
        assert_eq!(parent.status, TaskStatus::Ready);

        let subtasks = graph
            .split(parent.id, &ArraySplit::new("shards", 2))
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 3);
        for subtask in &subtasks {
            assert_eq!(subtask.status, TaskStatus::Ready);
            assert_eq!(subtask.priority, 7);
            assert_eq!(subtask.criticality, Criticality::High);
            assert_eq!(subtask.task_type, parent.task_type);
        }

        let gated = graph.get(parent.id).await.unwrap();
        assert_eq!(gated.status, TaskStatus::Pending);
        assert_eq!(gated.dependencies.len(), 3);
        let ready: Vec<Uuid> = graph.next_ready(10).await.unwrap().iter().map(|t| t.id).collect();
        assert!(!ready.contains(&parent.id));

        for subtask in &subtasks[..2] {
            graph.mark_completed(subtask.id).await.unwrap();
        }
        assert_eq!(graph.get(parent.id).await.unwrap().status, TaskStatus::Pending);
        let promoted = graph.mark_completed(subtasks[2].id).await.unwrap();
        assert_eq!(promoted, vec![parent.id]);
    }

    #[tokio::test]
    async fn test_split_orders_subtasks_by_index() {
        let store = MockStore::new();
        let graph = graph(&store);
        let parent = graph.submit(TaskBuilder::new().build()).await.unwrap();

        let pipeline = |_: &Task| -> SchedulerResult<Vec<SubtaskSpec>> {
            Ok(vec![
                SubtaskSpec::new(serde_json::json!({ "stage": "fetch" })),
                SubtaskSpec::new(serde_json::json!({ "stage": "build" })).after(0),
            ])
        };
        let subtasks = graph.split(parent.id, &pipeline).await.unwrap();

        assert_eq!(subtasks[0].status, TaskStatus::Ready);
        assert_eq!(subtasks[1].status, TaskStatus::Pending);
        assert_eq!(subtasks[1].dependencies, vec![subtasks[0].id]);
    }

    #[tokio::test]
    async fn test_split_rejects_held_task_and_forward_reference() {
        let store = MockStore::new();
        let graph = graph(&store);
        let worker = WorkerBuilder::new().with_load(1).build();
        store.put_worker(worker.clone());
        let running = TaskBuilder::new().running_on(worker.id).build();
        store.put_task(running.clone());

        assert!(matches!(
            graph.split(running.id, &ArraySplit::new("items", 1)).await,
            Err(SchedulerError::InvalidStateTransition(_))
        ));

        let parent = graph.submit(TaskBuilder::new().build()).await.unwrap();
        let forward = |_: &Task| -> SchedulerResult<Vec<SubtaskSpec>> {
            Ok(vec![SubtaskSpec::new(serde_json::json!({})).after(1)])
        };
        assert!(matches!(
            graph.split(parent.id, &forward).await,
            Err(SchedulerError::InvalidTaskParams(_))
        ));
        let unchanged = graph.get(parent.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Ready);
        assert!(unchanged.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_progress() {
        let store = MockStore::new();
        let graph = graph(&store);
        let task = graph.submit(TaskBuilder::new().build()).await.unwrap();
        assert_eq!(graph.progress(task.id).await.unwrap(), 0.0);
        graph.mark_completed(task.id).await.unwrap();
        assert_eq!(graph.progress(task.id).await.unwrap(), 100.0);
    }
}
