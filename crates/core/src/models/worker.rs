use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SchedulerError;

/// Worker管理状态，只能由运维显式修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Maintenance,
    Failed,
    Offline,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 5] = [
        WorkerStatus::Active,
        WorkerStatus::Inactive,
        WorkerStatus::Maintenance,
        WorkerStatus::Failed,
        WorkerStatus::Offline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Inactive => "inactive",
            WorkerStatus::Maintenance => "maintenance",
            WorkerStatus::Failed => "failed",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的Worker状态: {s}")))
    }
}

/// Worker健康状态，由心跳和主动探测推导
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl WorkerHealth {
    pub const ALL: [WorkerHealth; 4] = [
        WorkerHealth::Healthy,
        WorkerHealth::Degraded,
        WorkerHealth::Unhealthy,
        WorkerHealth::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerHealth::Healthy => "healthy",
            WorkerHealth::Degraded => "degraded",
            WorkerHealth::Unhealthy => "unhealthy",
            WorkerHealth::Unknown => "unknown",
        }
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerHealth {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerHealth::ALL
            .iter()
            .find(|health| health.as_str() == s)
            .copied()
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的健康状态: {s}")))
    }
}

/// 健康探测协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeProtocol {
    Http,
    Https,
    Rpc,
    Tcp,
    /// 未声明或无法识别的协议，只依赖心跳判断
    #[serde(other)]
    Unknown,
}

impl ProbeProtocol {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "http" => ProbeProtocol::Http,
            "https" => ProbeProtocol::Https,
            "rpc" | "grpc" => ProbeProtocol::Rpc,
            "tcp" => ProbeProtocol::Tcp,
            _ => ProbeProtocol::Unknown,
        }
    }
}

/// Worker的传输描述，对调度器是不透明的
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub protocol: ProbeProtocol,
    /// host:port
    pub address: String,
    /// HTTP健康检查路径，未设置时使用全局默认值
    #[serde(default)]
    pub health_endpoint: Option<String>,
}

impl TransportConfig {
    pub fn new(protocol: ProbeProtocol, address: impl Into<String>) -> Self {
        Self {
            protocol,
            address: address.into(),
            health_endpoint: None,
        }
    }
}

/// Worker声明的硬件资源
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_count: i32,
    pub total_memory: i64,
    pub total_disk: i64,
    pub gpu_count: i32,
    pub gpu_model: Option<String>,
    pub gpu_memory: i64,
}

/// 心跳携带的资源使用情况（百分比）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub network_rx: i64,
    pub network_tx: i64,
    pub temperature: Option<f64>,
}

impl WorkerMetrics {
    /// 任意一项资源使用率超过阈值
    pub fn under_pressure(&self, threshold: f64) -> bool {
        self.cpu_usage > threshold || self.memory_usage > threshold || self.disk_usage > threshold
    }
}

/// 已注册的Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub hostname: String,
    pub transport: TransportConfig,
    pub capabilities: Vec<String>,
    pub resources: Resources,
    pub status: WorkerStatus,
    pub health: WorkerHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_tasks_count: i32,
    pub max_concurrent_tasks: i32,
    pub consecutive_probe_failures: i32,
    pub metrics: Option<WorkerMetrics>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn remaining_capacity(&self) -> i32 {
        (self.max_concurrent_tasks - self.current_tasks_count).max(0)
    }

    pub fn can_accept_task(&self) -> bool {
        self.remaining_capacity() > 0
    }

    /// 声明的能力是否覆盖所需能力
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.capabilities.contains(tag))
    }

    /// 可接收新任务：Active + Healthy + 有剩余容量
    pub fn is_eligible(&self) -> bool {
        self.status == WorkerStatus::Active
            && self.health == WorkerHealth::Healthy
            && self.can_accept_task()
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat.map(|at| now - at)
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 100.0;
        }
        (self.current_tasks_count as f64 / self.max_concurrent_tasks as f64) * 100.0
    }
}

/// Worker注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub hostname: String,
    pub transport: TransportConfig,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    pub max_concurrent_tasks: i32,
}

impl WorkerRegistration {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.hostname.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "Worker主机名不能为空".to_string(),
            ));
        }
        if self.max_concurrent_tasks <= 0 {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "最大并发任务数必须大于0: {}",
                self.max_concurrent_tasks
            )));
        }
        Ok(())
    }

    /// 生成新的Worker记录，健康状态为Unknown直到首次探测成功
    pub fn into_worker(self, now: DateTime<Utc>) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            hostname: self.hostname,
            transport: self.transport,
            capabilities: self.capabilities,
            resources: self.resources,
            status: WorkerStatus::Active,
            health: WorkerHealth::Unknown,
            last_heartbeat: Some(now),
            current_tasks_count: 0,
            max_concurrent_tasks: self.max_concurrent_tasks,
            consecutive_probe_failures: 0,
            metrics: None,
            registered_at: now,
            updated_at: now,
        }
    }
}

/// Worker集群统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub total: usize,
    pub active: usize,
    pub healthy: usize,
    pub running_tasks: i64,
    pub available_slots: i64,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
}

impl WorkerStats {
    pub fn from_workers(workers: &[Worker]) -> Self {
        let mut stats = WorkerStats {
            total: workers.len(),
            ..Default::default()
        };
        let mut reporting = 0usize;

        for worker in workers {
            if worker.status == WorkerStatus::Active {
                stats.active += 1;
                stats.available_slots += worker.remaining_capacity() as i64;
            }
            if worker.health == WorkerHealth::Healthy {
                stats.healthy += 1;
            }
            stats.running_tasks += worker.current_tasks_count as i64;
            if let Some(metrics) = &worker.metrics {
                stats.avg_cpu_usage += metrics.cpu_usage;
                stats.avg_memory_usage += metrics.memory_usage;
                reporting += 1;
            }
        }

        if reporting > 0 {
            stats.avg_cpu_usage /= reporting as f64;
            stats.avg_memory_usage /= reporting as f64;
        }
        stats
    }
}
