use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务检查点，只追加不修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub name: Option<String>,
    /// 同一任务内单调递增
    pub version: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// 待写入的检查点
#[derive(Debug, Clone, PartialEq)]
pub struct NewCheckpoint {
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub name: Option<String>,
    /// 为空时由存储分配下一个版本号
    pub version: Option<i64>,
    pub data: serde_json::Value,
}

impl NewCheckpoint {
    pub fn new(task_id: Uuid, worker_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            task_id,
            worker_id,
            name: None,
            version: None,
            data,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}
