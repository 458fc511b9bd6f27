//! Test data builders for tasks and workers
//!
//! Defaults are chosen so a built worker is immediately eligible and a built
//! task is immediately dispatchable.

use chrono::{DateTime, Utc};
use taskmesh_core::models::{
    Criticality, ProbeProtocol, Resources, Task, TaskStatus, TransportConfig, Worker,
    WorkerHealth, WorkerMetrics, WorkerStatus,
};
use uuid::Uuid;

/// Builder for test `Task` records
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new("test_task", serde_json::json!({})),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task.task_type = task_type.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.task.criticality = criticality;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.task.dependencies = dependencies;
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.task.required_capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self
    }

    pub fn with_estimated_duration(mut self, seconds: i64) -> Self {
        self.task.estimated_duration_secs = Some(seconds);
        self
    }

    pub fn ready(mut self) -> Self {
        self.task.status = TaskStatus::Ready;
        self
    }

    /// 已分配给指定Worker并处于运行中
    pub fn running_on(mut self, worker_id: Uuid) -> Self {
        self.task.status = TaskStatus::Running;
        self.task.assigned_worker_id = Some(worker_id);
        self.task.original_worker_id = Some(worker_id);
        self.task.started_at = Some(Utc::now());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test `Worker` records
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Self {
            worker: Worker {
                id,
                hostname: format!("worker-{}", &id.simple().to_string()[..8]),
                transport: TransportConfig::new(ProbeProtocol::Http, "127.0.0.1:8080"),
                capabilities: Vec::new(),
                resources: Resources {
                    cpu_count: 4,
                    total_memory: 8 << 30,
                    ..Default::default()
                },
                status: WorkerStatus::Active,
                health: WorkerHealth::Healthy,
                last_heartbeat: Some(now),
                current_tasks_count: 0,
                max_concurrent_tasks: 10,
                consecutive_probe_failures: 0,
                metrics: None,
                registered_at: now,
                updated_at: now,
            },
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.worker.id = id;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.worker.hostname = hostname.to_string();
        self
    }

    pub fn with_protocol(mut self, protocol: ProbeProtocol) -> Self {
        self.worker.transport.protocol = protocol;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.worker.transport.address = address.into();
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: &str) -> Self {
        self.worker.transport.health_endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.worker.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_capacity(mut self, max_concurrent_tasks: i32) -> Self {
        self.worker.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    pub fn with_load(mut self, current_tasks_count: i32) -> Self {
        self.worker.current_tasks_count = current_tasks_count;
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.worker.status = status;
        self
    }

    pub fn with_health(mut self, health: WorkerHealth) -> Self {
        self.worker.health = health;
        self
    }

    pub fn with_last_heartbeat(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.worker.last_heartbeat = at;
        self
    }

    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.worker.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
