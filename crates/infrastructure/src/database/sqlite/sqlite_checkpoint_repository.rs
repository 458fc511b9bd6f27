use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use taskmesh_core::{
    models::{Checkpoint, NewCheckpoint},
    traits::CheckpointRepository,
    SchedulerError, SchedulerResult,
};

use crate::database::mapping::{json_column, to_json, uuid_column};

pub struct SqliteCheckpointRepository {
    pool: SqlitePool,
}

impl SqliteCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: &SqliteRow) -> SchedulerResult<Checkpoint> {
        Ok(Checkpoint {
            id: uuid_column(row, "id")?,
            task_id: uuid_column(row, "task_id")?,
            worker_id: uuid_column(row, "worker_id")?,
            name: row.try_get("checkpoint_name")?,
            version: row.try_get("version")?,
            data: json_column(row, "checkpoint_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl CheckpointRepository for SqliteCheckpointRepository {
    async fn append(&self, checkpoint: &NewCheckpoint) -> SchedulerResult<Checkpoint> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let latest: i64 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS latest FROM task_checkpoints WHERE task_id = ?",
        )
        .bind(checkpoint.task_id.to_string())
        .fetch_one(&mut *tx)
        .await?
        .try_get("latest")?;

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

        sqlx::query(
            r#"
            INSERT INTO task_checkpoints (id, task_id, worker_id, checkpoint_name, version,
                checkpoint_data, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(saved.id.to_string())
        .bind(saved.task_id.to_string())
        .bind(saved.worker_id.to_string())
        .bind(&saved.name)
        .bind(saved.version)
        .bind(to_json(&saved.data, "检查点数据")?)
        .bind(saved.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("任务 {} 写入检查点版本 {}", saved.task_id, saved.version);
        Ok(saved)
    }

    async fn latest(&self, task_id: Uuid) -> SchedulerResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, worker_id, checkpoint_name, version, checkpoint_data, created_at
            FROM task_checkpoints WHERE task_id = ? ORDER BY version DESC LIMIT 1
            "#,
        )
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn list_for_task(&self, task_id: Uuid) -> SchedulerResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, worker_id, checkpoint_name, version, checkpoint_data, created_at
            FROM task_checkpoints WHERE task_id = ? ORDER BY version ASC
            "#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_checkpoint).collect()
    }
}
