//! In-memory test doubles
//!
//! `MockStore` keeps tasks, workers, checkpoints and connectivity events behind a
//! single mutex so the combined task/worker operations are atomic exactly like
//! the SQLite transactions. `set_available(false)` makes every call fail with a
//! store error for degraded-mode tests. The `on_next_*_read` hooks run once right
//! after a `get_by_id` returns its snapshot, which lets a test interleave a
//! concurrent writer between a caller's read and its write. `fail_next_writes`
//! makes the next few completions and releases fail with a chosen error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskmesh_core::{
    models::{
        Checkpoint, ConnectivityEvent, NewCheckpoint, Task, TaskStatus, Worker, WorkerHealth,
        WorkerMetrics, WorkerStatus,
    },
    traits::{
        CheckpointRepository, ConnectivityEventRepository, DispatchRequest, ExecutionTransport,
        RpcHealthClient, ServingStatus, TaskRepository, WorkerRepository,
    },
    SchedulerError, SchedulerResult,
};
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<Uuid, Worker>,
    checkpoints: Vec<Checkpoint>,
    events: Vec<ConnectivityEvent>,
}

impl StoreState {
    fn release_slot(&mut self, worker_id: Uuid, now: DateTime<Utc>) {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.current_tasks_count = (worker.current_tasks_count - 1).max(0);
            worker.updated_at = now;
        }
    }

    fn promote_pending(&mut self, now: DateTime<Utc>, dependents_of: Option<Uuid>) -> Vec<Uuid> {
        let completed: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        let mut promoted = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status != TaskStatus::Pending || !task.retry_due(now) {
                continue;
            }
            if let Some(parent) = dependents_of {
                if !task.dependencies.contains(&parent) {
                    continue;
                }
            }
            if task.dependencies.iter().all(|d| completed.contains(d)) {
                task.status = TaskStatus::Ready;
                task.retry_at = None;
                task.updated_at = now;
                promoted.push(task.id);
            }
        }
        promoted
    }
}

type ReadHook = Box<dyn FnOnce(&MockStore) + Send>;

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
    task_read_hook: Arc<Mutex<Option<ReadHook>>>,
    worker_read_hook: Arc<Mutex<Option<ReadHook>>>,
    injected: Arc<Mutex<Option<(usize, fn() -> SchedulerError)>>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_repository(&self) -> Arc<MockTaskRepository> {
        Arc::new(MockTaskRepository {
            store: self.clone(),
        })
    }

    pub fn worker_repository(&self) -> Arc<MockWorkerRepository> {
        Arc::new(MockWorkerRepository {
            store: self.clone(),
        })
    }

    pub fn checkpoint_repository(&self) -> Arc<MockCheckpointRepository> {
        Arc::new(MockCheckpointRepository {
            store: self.clone(),
        })
    }

    pub fn connectivity_repository(&self) -> Arc<MockConnectivityEventRepository> {
        Arc::new(MockConnectivityEventRepository {
            store: self.clone(),
        })
    }

    /// 模拟权威存储宕机或恢复
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 直接写入Worker记录，包括负载计数
    pub fn put_worker(&self, worker: Worker) {
        self.lock().workers.insert(worker.id, worker);
    }

    pub fn put_task(&self, task: Task) {
        self.lock().tasks.insert(task.id, task);
    }

    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    pub fn worker(&self, id: Uuid) -> Option<Worker> {
        self.lock().workers.get(&id).cloned()
    }

    /// 下一次按ID读取任务之后执行一次
    pub fn on_next_task_read(&self, hook: impl FnOnce(&MockStore) + Send + 'static) {
        *self.task_read_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// 下一次按ID读取Worker之后执行一次
    pub fn on_next_worker_read(&self, hook: impl FnOnce(&MockStore) + Send + 'static) {
        *self.worker_read_hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// 接下来 `count` 次完成或释放操作以 `error()` 失败，不做任何修改
    pub fn fail_next_writes(&self, count: usize, error: fn() -> SchedulerError) {
        *self.injected.lock().unwrap() = Some((count, error));
    }

    fn injected_failure(&self) -> SchedulerResult<()> {
        let mut injected = self.injected.lock().unwrap();
        match injected.as_mut() {
            Some((remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error())
            }
            _ => Ok(()),
        }
    }

    fn fire(&self, slot: &Mutex<Option<ReadHook>>) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    fn guard(&self) -> SchedulerResult<MutexGuard<'_, StoreState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::StoreUnavailable(
                "模拟存储不可用".to_string(),
            ));
        }
        Ok(self.lock())
    }
}

#[derive(Clone)]
pub struct MockTaskRepository {
    store: MockStore,
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut state = self.store.guard()?;
        state.tasks.insert(task.id, task.clone());
        Ok(task.clone())
    }

    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<()> {
        let mut state = self.store.guard()?;
        for task in tasks {
            state.tasks.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        let found = self.store.guard()?.tasks.get(&id).cloned();
        self.store.fire(&self.store.task_read_hook);
        Ok(found)
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> SchedulerResult<Vec<Task>> {
        let state = self.store.guard()?;
        Ok(ids.iter().filter_map(|id| state.tasks.get(id).cloned()).collect())
    }

    async fn update_if_status(
        &self,
        task: &Task,
        expected: &[TaskStatus],
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;
        match state.tasks.get_mut(&task.id) {
            Some(existing) if expected.contains(&existing.status) => {
                *existing = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_all(&self) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.store.guard()?.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .store
            .guard()?
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_by_worker(&self, worker_id: Uuid) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .store
            .guard()?
            .tasks
            .values()
            .filter(|t| t.status.holds_worker() && t.assigned_worker_id == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, i64>> {
        let mut counts = HashMap::new();
        for task in self.store.guard()?.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn promote_ready(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Uuid>> {
        Ok(self.store.guard()?.promote_pending(now, None))
    }

    async fn try_assign(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;

        let task_ready = state
            .tasks
            .get(&task_id)
            .map(|t| t.status == TaskStatus::Ready)
            .unwrap_or(false);
        let worker_ok = state
            .workers
            .get(&worker_id)
            .map(|w| {
                w.status == WorkerStatus::Active
                    && w.health == WorkerHealth::Healthy
                    && w.current_tasks_count < w.max_concurrent_tasks
            })
            .unwrap_or(false);
        if !task_ready || !worker_ok {
            return Ok(false);
        }

        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_worker_id = Some(worker_id);
            task.original_worker_id.get_or_insert(worker_id);
            task.updated_at = now;
        }
        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.current_tasks_count += 1;
            worker.updated_at = now;
        }
        Ok(true)
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;
        match state.tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Assigned
                    && task.assigned_worker_id == Some(worker_id) =>
            {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Vec<Uuid>>> {
        self.store.injected_failure()?;
        let mut state = self.store.guard()?;

        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        let previous = task.status;
        let holder = task.assigned_worker_id;
        let stale = match worker_id {
            Some(expected) => !previous.holds_worker() || holder != Some(expected),
            None => previous.is_terminal(),
        };
        if stale {
            return Ok(None);
        }

        task.status = TaskStatus::Completed;
        task.result = result;
        task.error_message = None;
        task.retry_at = None;
        task.completed_at = Some(now);
        task.updated_at = now;

        if previous.holds_worker() {
            if let Some(holder) = holder {
                state.release_slot(holder, now);
            }
        }
        Ok(Some(state.promote_pending(now, Some(task_id))))
    }

    async fn release(&self, task: &Task, worker_id: Uuid) -> SchedulerResult<bool> {
        self.store.injected_failure()?;
        let mut state = self.store.guard()?;
        let held = state
            .tasks
            .get(&task.id)
            .map(|t| t.status.holds_worker() && t.assigned_worker_id == Some(worker_id))
            .unwrap_or(false);
        if !held {
            return Ok(false);
        }
        state.tasks.insert(task.id, task.clone());
        state.release_slot(worker_id, task.updated_at);
        Ok(true)
    }

    async fn set_checkpoint_ref(
        &self,
        task_id: Uuid,
        checkpoint_id: Uuid,
    ) -> SchedulerResult<()> {
        let mut state = self.store.guard()?;
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        task.checkpoint_ref = Some(checkpoint_id);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        self.store.guard().map(|_| ())
    }
}

#[derive(Clone)]
pub struct MockWorkerRepository {
    store: MockStore,
}

#[async_trait]
impl WorkerRepository for MockWorkerRepository {
    async fn create(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut state = self.store.guard()?;
        if state.workers.values().any(|w| w.hostname == worker.hostname) {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "主机名已存在: {}",
                worker.hostname
            )));
        }
        state.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Worker>> {
        let found = self.store.guard()?.workers.get(&id).cloned();
        self.store.fire(&self.store.worker_read_hook);
        Ok(found)
    }

    async fn find_by_hostname(&self, hostname: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self
            .store
            .guard()?
            .workers
            .values()
            .find(|w| w.hostname == hostname)
            .cloned())
    }

    async fn update(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut state = self.store.guard()?;
        let existing = state
            .workers
            .get_mut(&worker.id)
            .ok_or(SchedulerError::WorkerNotFound { id: worker.id })?;
        let load = existing.current_tasks_count;
        *existing = worker.clone();
        existing.current_tasks_count = load;
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        metrics: Option<&WorkerMetrics>,
        degrade: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;
        let Some(worker) = state.workers.get_mut(&id) else {
            return Ok(false);
        };
        if worker.last_heartbeat.map(|previous| at > previous).unwrap_or(true) {
            worker.last_heartbeat = Some(at);
        }
        if let Some(metrics) = metrics {
            worker.metrics = Some(metrics.clone());
        }
        if degrade && worker.health == WorkerHealth::Healthy {
            worker.health = WorkerHealth::Degraded;
        }
        worker.updated_at = now;
        Ok(true)
    }

    async fn update_health(
        &self,
        id: Uuid,
        health: WorkerHealth,
        consecutive_failures: i32,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;
        let Some(worker) = state.workers.get_mut(&id) else {
            return Ok(false);
        };
        worker.health = health;
        worker.consecutive_probe_failures = consecutive_failures;
        worker.updated_at = now;
        Ok(true)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut state = self.store.guard()?;
        let Some(worker) = state.workers.get_mut(&id) else {
            return Ok(false);
        };
        worker.status = status;
        worker.updated_at = now;
        Ok(true)
    }

    async fn list(&self) -> SchedulerResult<Vec<Worker>> {
        let mut workers: Vec<Worker> = self.store.guard()?.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.registered_at);
        Ok(workers)
    }

    async fn delete(&self, id: Uuid) -> SchedulerResult<bool> {
        Ok(self.store.guard()?.workers.remove(&id).is_some())
    }
}

#[derive(Clone)]
pub struct MockCheckpointRepository {
    store: MockStore,
}

#[async_trait]
impl CheckpointRepository for MockCheckpointRepository {
    async fn append(&self, checkpoint: &NewCheckpoint) -> SchedulerResult<Checkpoint> {
        let mut state = self.store.guard()?;
        let latest = state
            .checkpoints
            .iter()
            .filter(|c| c.task_id == checkpoint.task_id)
            .map(|c| c.version)
            .max()
            .unwrap_or(0);

        let version = match checkpoint.version {
            Some(version) if version <= latest => {
                return Err(SchedulerError::StaleCheckpoint {
                    task_id: checkpoint.task_id,
                    latest,
                    attempted: version,
                });
            }
            Some(version) => version,
            None => latest + 1,
        };

        let saved = Checkpoint {
            id: Uuid::new_v4(),
            task_id: checkpoint.task_id,
            worker_id: checkpoint.worker_id,
            name: checkpoint.name.clone(),
            version,
            data: checkpoint.data.clone(),
            created_at: Utc::now(),
        };
        state.checkpoints.push(saved.clone());
        Ok(saved)
    }

    async fn latest(&self, task_id: Uuid) -> SchedulerResult<Option<Checkpoint>> {
        Ok(self
            .store
            .guard()?
            .checkpoints
            .iter()
            .filter(|c| c.task_id == task_id)
            .max_by_key(|c| c.version)
            .cloned())
    }

    async fn list_for_task(&self, task_id: Uuid) -> SchedulerResult<Vec<Checkpoint>> {
        let mut history: Vec<Checkpoint> = self
            .store
            .guard()?
            .checkpoints
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect();
        history.sort_by_key(|c| c.version);
        Ok(history)
    }
}

#[derive(Clone)]
pub struct MockConnectivityEventRepository {
    store: MockStore,
}

#[async_trait]
impl ConnectivityEventRepository for MockConnectivityEventRepository {
    async fn record(&self, event: &ConnectivityEvent) -> SchedulerResult<()> {
        self.store.guard()?.events.push(event.clone());
        Ok(())
    }

    async fn list_for_worker(
        &self,
        worker_id: Uuid,
        limit: i64,
    ) -> SchedulerResult<Vec<ConnectivityEvent>> {
        Ok(self
            .store
            .guard()?
            .events
            .iter()
            .rev()
            .filter(|e| e.worker_id == worker_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Scripted outcome of one dispatch
#[derive(Debug, Clone)]
pub enum Scripted {
    Success(serde_json::Value),
    /// 以可重试错误失败
    Transient(String),
    /// 以终止错误失败
    Terminal(String),
    /// 永不返回，直到被取消
    Hang,
}

/// Execution transport that replays scripted outcomes
///
/// Queued outcomes are consumed in order; once the queue is empty every dispatch
/// gets the default outcome.
#[derive(Clone)]
pub struct MockExecutionTransport {
    default: Arc<Mutex<Scripted>>,
    queue: Arc<Mutex<VecDeque<Scripted>>>,
    delay: Arc<Mutex<Duration>>,
    dispatched: Arc<Mutex<Vec<(Uuid, DispatchRequest)>>>,
    cancelled: Arc<Mutex<Vec<(Uuid, Uuid)>>>,
}

impl MockExecutionTransport {
    pub fn new() -> Self {
        Self::with_default(Scripted::Success(serde_json::json!({ "ok": true })))
    }

    pub fn with_default(outcome: Scripted) -> Self {
        Self {
            default: Arc::new(Mutex::new(outcome)),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, outcome: Scripted) {
        self.queue.lock().unwrap().push_back(outcome);
    }

    pub fn set_default(&self, outcome: Scripted) {
        *self.default.lock().unwrap() = outcome;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// (worker_id, request) for every dispatch so far
    pub fn dispatched(&self) -> Vec<(Uuid, DispatchRequest)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    /// (worker_id, task_id) for every cancel so far
    pub fn cancelled(&self) -> Vec<(Uuid, Uuid)> {
        self.cancelled.lock().unwrap().clone()
    }

    fn next_outcome(&self) -> Scripted {
        let queued = self.queue.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

impl Default for MockExecutionTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionTransport for MockExecutionTransport {
    async fn dispatch(
        &self,
        worker: &Worker,
        request: DispatchRequest,
    ) -> SchedulerResult<serde_json::Value> {
        self.dispatched
            .lock()
            .unwrap()
            .push((worker.id, request.clone()));
        let outcome = self.next_outcome();
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Scripted::Success(value) => Ok(value),
            Scripted::Transient(message) => Err(SchedulerError::ConnectionReset(message)),
            Scripted::Terminal(message) => Err(SchedulerError::TaskExecution(message)),
            Scripted::Hang => std::future::pending().await,
        }
    }

    async fn cancel(&self, worker: &Worker, task_id: Uuid) -> SchedulerResult<()> {
        self.cancelled.lock().unwrap().push((worker.id, task_id));
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// RPC health client answering from a per-address table
#[derive(Clone, Default)]
pub struct MockRpcHealthClient {
    statuses: Arc<Mutex<HashMap<String, ServingStatus>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockRpcHealthClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, address: &str, status: ServingStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(address.to_string(), status);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcHealthClient for MockRpcHealthClient {
    async fn check(&self, address: &str) -> SchedulerResult<ServingStatus> {
        self.calls.lock().unwrap().push(address.to_string());
        match self.statuses.lock().unwrap().get(address) {
            Some(status) => Ok(*status),
            None => Err(SchedulerError::ConnectionRefused(address.to_string())),
        }
    }
}
