use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SchedulerError;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Paused,
    WaitingForWorker,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Paused,
        TaskStatus::WaitingForWorker,
        TaskStatus::Cancelled,
    ];

    /// 未结束且不占用Worker槽位的状态
    pub const UNHELD: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Paused,
        TaskStatus::WaitingForWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitingForWorker => "waiting_for_worker",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 终态任务不会再被调度
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 任务当前是否占用Worker
    pub fn holds_worker(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的任务状态: {s}")))
    }
}

/// 任务关键性等级，调度排序的第一关键字
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Low => "low",
            Criticality::Normal => "normal",
            Criticality::High => "high",
            Criticality::Critical => "critical",
        }
    }

    /// 数值越大越关键
    pub fn rank(&self) -> i32 {
        match self {
            Criticality::Low => 0,
            Criticality::Normal => 1,
            Criticality::High => 2,
            Criticality::Critical => 3,
        }
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criticality {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Criticality::Low),
            "normal" => Ok(Criticality::Normal),
            "high" => Ok(Criticality::High),
            "critical" => Ok(Criticality::Critical),
            _ => Err(SchedulerError::Serialization(format!(
                "无效的关键性等级: {s}"
            ))),
        }
    }
}

/// 调度任务
///
/// `priority` 数值越小越先调度，同一关键性等级内生效。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub criticality: Criticality,
    pub dependencies: Vec<Uuid>,
    pub required_capabilities: Vec<String>,
    pub assigned_worker_id: Option<Uuid>,
    pub original_worker_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub checkpoint_ref: Option<Uuid>,
    pub estimated_duration_secs: Option<i64>,
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// 创建一个待调度任务
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::Pending,
            priority: 0,
            criticality: Criticality::Normal,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            assigned_worker_id: None,
            original_worker_id: None,
            retry_count: 0,
            max_retries: 3,
            error_message: None,
            result: None,
            checkpoint_ref: None,
            estimated_duration_secs: None,
            retry_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 是否还能重试
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 退避等待是否已结束
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.map(|at| at <= now).unwrap_or(true)
    }

    /// 估算任务进度（0-100）
    pub fn progress(&self, now: DateTime<Utc>) -> f64 {
        match self.status {
            TaskStatus::Completed => 100.0,
            TaskStatus::Running => match (self.started_at, self.estimated_duration_secs) {
                (Some(started), Some(estimate)) if estimate > 0 => {
                    let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
                    (elapsed / estimate as f64 * 100.0).clamp(0.0, 95.0)
                }
                _ => 50.0,
            },
            _ => 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "任务类型不能为空".to_string(),
            ));
        }
        if self.max_retries < 0 {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "最大重试次数不能为负数: {}",
                self.max_retries
            )));
        }
        if let Some(estimate) = self.estimated_duration_secs {
            if estimate <= 0 {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "预估执行时长必须大于0: {estimate}"
                )));
            }
        }
        Ok(())
    }
}

/// 调度顺序：关键性降序，优先级升序，创建时间升序
pub fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.criticality
        .rank()
        .cmp(&a.criticality.rank())
        .then(a.priority.cmp(&b.priority))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_dispatch_order_prefers_criticality() {
        let now = Utc::now();
        let mut critical = Task::new("build", serde_json::json!({}))
            .with_criticality(Criticality::Critical)
            .with_priority(100);
        critical.created_at = now;
        let mut normal = Task::new("build", serde_json::json!({})).with_priority(1);
        normal.created_at = now - Duration::hours(1);

        let mut tasks = vec![normal.clone(), critical.clone()];
        tasks.sort_by(dispatch_order);
        assert_eq!(tasks[0].id, critical.id);
    }

    #[test]
    fn test_dispatch_order_priority_then_age() {
        let now = Utc::now();
        let mut older = Task::new("test", serde_json::json!({})).with_priority(5);
        older.created_at = now - Duration::seconds(10);
        let mut newer = Task::new("test", serde_json::json!({})).with_priority(5);
        newer.created_at = now;
        let urgent = Task::new("test", serde_json::json!({})).with_priority(1);

        let mut tasks = vec![newer.clone(), older.clone(), urgent.clone()];
        tasks.sort_by(dispatch_order);
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![urgent.id, older.id, newer.id]);
    }

    #[test]
    fn test_progress_estimate() {
        let now = Utc::now();
        let mut task = Task::new("deploy", serde_json::json!({}));
        assert_eq!(task.progress(now), 0.0);

        task.status = TaskStatus::Running;
        task.started_at = Some(now - Duration::seconds(30));
        assert_eq!(task.progress(now), 50.0);

        task.estimated_duration_secs = Some(60);
        assert!((task.progress(now) - 50.0).abs() < 1.0);

        task.started_at = Some(now - Duration::seconds(600));
        assert_eq!(task.progress(now), 95.0);

        task.status = TaskStatus::Completed;
        assert_eq!(task.progress(now), 100.0);
    }

    #[test]
    fn test_validate_rejects_empty_type() {
        let task = Task::new("  ", serde_json::json!({}));
        assert!(matches!(
            task.validate(),
            Err(SchedulerError::InvalidTaskParams(_))
        ));
    }
}
