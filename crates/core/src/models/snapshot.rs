use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkerStats;

/// 单个Worker的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLoad {
    pub worker_id: Uuid,
    pub hostname: String,
    pub status: String,
    pub health: String,
    pub current_tasks: i32,
    pub max_concurrent_tasks: i32,
}

/// 重试统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
}

/// 供监控集成使用的调度器快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub tasks_by_status: BTreeMap<String, i64>,
    pub workers_by_status: BTreeMap<String, i64>,
    pub workers_by_health: BTreeMap<String, i64>,
    pub worker_loads: Vec<WorkerLoad>,
    pub worker_stats: WorkerStats,
    pub retry_stats: BTreeMap<String, RetryStats>,
    pub degraded: bool,
}
