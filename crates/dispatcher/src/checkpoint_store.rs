//! Append-only task checkpoints
//!
//! Writes are time-bounded and retried under the shared retry policy. A lost
//! checkpoint only weakens recovery, so callers treat a final save failure as
//! a warning rather than a task failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use taskmesh_core::{
    models::{Checkpoint, NewCheckpoint, RetryStats},
    traits::{CheckpointRepository, TaskRepository},
    RetryPolicy, SchedulerResult,
};
use taskmesh_infrastructure::{MetricsCollector, TimeoutHandler};

const SAVE_OPERATION: &str = "checkpoint_save";

pub struct CheckpointStore {
    checkpoint_repo: Arc<dyn CheckpointRepository>,
    task_repo: Arc<dyn TaskRepository>,
    retry: RetryPolicy,
    timeout: TimeoutHandler,
    metrics: Arc<MetricsCollector>,
}

impl CheckpointStore {
    pub fn new(
        checkpoint_repo: Arc<dyn CheckpointRepository>,
        task_repo: Arc<dyn TaskRepository>,
        retry: RetryPolicy,
        timeout: TimeoutHandler,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            checkpoint_repo,
            task_repo,
            retry,
            timeout,
            metrics,
        }
    }

    /// 追加一个新版本
    pub async fn save(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        data: serde_json::Value,
        name: Option<String>,
    ) -> SchedulerResult<Checkpoint> {
        let mut checkpoint = NewCheckpoint::new(task_id, worker_id, data);
        checkpoint.name = name;
        self.append(checkpoint).await
    }

    /// 以指定版本写入，版本不高于当前最新版本时返回 `StaleCheckpoint`
    pub async fn save_versioned(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        version: i64,
        data: serde_json::Value,
    ) -> SchedulerResult<Checkpoint> {
        self.append(NewCheckpoint::new(task_id, worker_id, data).with_version(version))
            .await
    }

    #[instrument(skip(self, checkpoint), fields(task_id = %checkpoint.task_id, worker_id = %checkpoint.worker_id))]
    async fn append(&self, checkpoint: NewCheckpoint) -> SchedulerResult<Checkpoint> {
        let task_label = checkpoint.task_id.to_string();
        let (repo, timeout) = (&self.checkpoint_repo, &self.timeout);
        let (checkpoint, task_label) = (&checkpoint, task_label.as_str());
        let result = self
            .retry
            .execute(SAVE_OPERATION, move || {
                timeout.checkpoint_write(repo.append(checkpoint), task_label)
            })
            .await;

        let saved = match result {
            Ok(saved) => saved,
            Err(e) => {
                self.metrics.record_checkpoint_failure();
                warn!("检查点写入失败: {}", e);
                return Err(e);
            }
        };
        self.metrics.record_checkpoint_saved();

        // 引用只是加速查找，最新版本始终以检查点表为准
        if let Err(e) = self
            .task_repo
            .set_checkpoint_ref(saved.task_id, saved.id)
            .await
        {
            warn!("更新任务 {} 的检查点引用失败: {}", saved.task_id, e);
        }

        info!("检查点已保存: 任务 {} 版本 {}", saved.task_id, saved.version);
        Ok(saved)
    }

    pub async fn latest(&self, task_id: Uuid) -> SchedulerResult<Option<Checkpoint>> {
        self.checkpoint_repo.latest(task_id).await
    }

    pub fn retry_stats(&self) -> BTreeMap<String, RetryStats> {
        self.retry.stats()
    }

    /// 全部版本，旧的在前
    pub async fn history(&self, task_id: Uuid) -> SchedulerResult<Vec<Checkpoint>> {
        self.checkpoint_repo.list_for_task(task_id).await
    }
}
