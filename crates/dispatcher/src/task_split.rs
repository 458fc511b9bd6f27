//! Splitting a large task into subtasks
//!
//! A strategy only decides what the subtasks carry. `TaskGraph::split` turns
//! them into real tasks that inherit the parent's scheduling attributes and
//! gates the parent on all of them.

use taskmesh_core::{models::Task, SchedulerError, SchedulerResult};

/// 一个待创建的子任务
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskSpec {
    pub payload: serde_json::Value,
    /// 依赖同一次拆分中排在前面的子任务（下标）
    pub depends_on: Vec<usize>,
}

impl SubtaskSpec {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, index: usize) -> Self {
        self.depends_on.push(index);
        self
    }
}

/// 拆分策略
pub trait SplitStrategy: Send + Sync {
    fn subtasks(&self, parent: &Task) -> SchedulerResult<Vec<SubtaskSpec>>;
}

impl<F> SplitStrategy for F
where
    F: Fn(&Task) -> SchedulerResult<Vec<SubtaskSpec>> + Send + Sync,
{
    fn subtasks(&self, parent: &Task) -> SchedulerResult<Vec<SubtaskSpec>> {
        self(parent)
    }
}

/// 把载荷中的一个数组字段按固定大小切块，子任务之间相互独立
///
/// 每个子任务的载荷是父任务载荷的副本，只把该字段替换为对应的一块。
#[derive(Debug, Clone)]
pub struct ArraySplit {
    field: String,
    chunk_size: usize,
}

impl ArraySplit {
    pub fn new(field: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            field: field.into(),
            chunk_size,
        }
    }
}

impl SplitStrategy for ArraySplit {
    fn subtasks(&self, parent: &Task) -> SchedulerResult<Vec<SubtaskSpec>> {
        if self.chunk_size == 0 {
            return Err(SchedulerError::InvalidTaskParams(
                "切块大小必须大于0".to_string(),
            ));
        }
        let items = parent
            .payload
            .get(&self.field)
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                SchedulerError::InvalidTaskParams(format!(
                    "任务 {} 的载荷没有数组字段 {}",
                    parent.id, self.field
                ))
            })?;

        Ok(items
            .chunks(self.chunk_size)
            .map(|chunk| {
                let mut payload = parent.payload.clone();
                payload[self.field.as_str()] = serde_json::Value::Array(chunk.to_vec());
                SubtaskSpec::new(payload)
            })
            .collect())
    }
}
