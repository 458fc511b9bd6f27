use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use taskmesh_core::{
    models::{Task, TaskStatus},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};

use crate::database::mapping::{
    json_column, optional_json_column, optional_uuid_column, to_json, uuid_column,
};

const TASK_COLUMNS: &str = "id, task_type, data, status, priority, criticality, dependencies, \
    required_capabilities, assigned_worker_id, original_worker_id, retry_count, max_retries, \
    error_message, result, checkpoint_ref, estimated_duration_secs, retry_at, created_at, \
    started_at, completed_at, updated_at";

/// 写事务以IMMEDIATE开始，先拿写锁再读，避免读后升级写锁时的SQLITE_BUSY
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

/// `write_back` 的附加条件
#[derive(Clone, Copy)]
enum WriteGuard<'a> {
    /// 任务仍由该Worker持有
    HeldBy(Uuid),
    StatusIn(&'a [TaskStatus]),
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let status: String = row.try_get("status")?;
        let criticality: String = row.try_get("criticality")?;
        let data: String = row.try_get("data")?;

        Ok(Task {
            id: uuid_column(row, "id")?,
            task_type: row.try_get("task_type")?,
            payload: serde_json::from_str(&data)?,
            status: status.parse()?,
            priority: row.try_get("priority")?,
            criticality: criticality.parse()?,
            dependencies: json_column(row, "dependencies")?,
            required_capabilities: json_column(row, "required_capabilities")?,
            assigned_worker_id: optional_uuid_column(row, "assigned_worker_id")?,
            original_worker_id: optional_uuid_column(row, "original_worker_id")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            result: optional_json_column(row, "result")?,
            checkpoint_ref: optional_uuid_column(row, "checkpoint_ref")?,
            estimated_duration_secs: row.try_get("estimated_duration_secs")?,
            retry_at: row.try_get("retry_at")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn insert(conn: &mut SqliteConnection, task: &Task) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, data, status, priority, criticality, dependencies,
                required_capabilities, assigned_worker_id, original_worker_id, retry_count,
                max_retries, error_message, result, checkpoint_ref, estimated_duration_secs,
                retry_at, created_at, started_at, completed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.task_type)
        .bind(to_json(&task.payload, "任务数据")?)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.criticality.as_str())
        .bind(to_json(&task.dependencies, "依赖列表")?)
        .bind(to_json(&task.required_capabilities, "能力标签")?)
        .bind(task.assigned_worker_id.map(|id| id.to_string()))
        .bind(task.original_worker_id.map(|id| id.to_string()))
        .bind(task.retry_count)
        .bind(task.max_retries)
        .bind(&task.error_message)
        .bind(task.result.as_ref().map(|r| to_json(r, "任务结果")).transpose()?)
        .bind(task.checkpoint_ref.map(|id| id.to_string()))
        .bind(task.estimated_duration_secs)
        .bind(task.retry_at)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(SchedulerError::Database)?;
        Ok(())
    }

    /// 按主键和附加条件写回整条记录
    async fn write_back(
        conn: &mut SqliteConnection,
        task: &Task,
        guard: WriteGuard<'_>,
    ) -> SchedulerResult<u64> {
        let mut sql = String::from(
            r#"
            UPDATE tasks SET task_type = ?, data = ?, status = ?, priority = ?, criticality = ?,
                dependencies = ?, required_capabilities = ?, assigned_worker_id = ?,
                original_worker_id = ?, retry_count = ?, max_retries = ?, error_message = ?,
                result = ?, checkpoint_ref = ?, estimated_duration_secs = ?, retry_at = ?,
                started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        );
        match guard {
            WriteGuard::HeldBy(_) => {
                sql.push_str(" AND assigned_worker_id = ? AND status IN ('assigned', 'running')");
            }
            WriteGuard::StatusIn(expected) => {
                let placeholders = vec!["?"; expected.len()].join(", ");
                sql.push_str(&format!(" AND status IN ({placeholders})"));
            }
        }

        let mut query = sqlx::query(&sql)
            .bind(&task.task_type)
            .bind(to_json(&task.payload, "任务数据")?)
            .bind(task.status.as_str())
            .bind(task.priority)
            .bind(task.criticality.as_str())
            .bind(to_json(&task.dependencies, "依赖列表")?)
            .bind(to_json(&task.required_capabilities, "能力标签")?)
            .bind(task.assigned_worker_id.map(|id| id.to_string()))
            .bind(task.original_worker_id.map(|id| id.to_string()))
            .bind(task.retry_count)
            .bind(task.max_retries)
            .bind(&task.error_message)
            .bind(task.result.as_ref().map(|r| to_json(r, "任务结果")).transpose()?)
            .bind(task.checkpoint_ref.map(|id| id.to_string()))
            .bind(task.estimated_duration_secs)
            .bind(task.retry_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.updated_at)
            .bind(task.id.to_string());
        match guard {
            WriteGuard::HeldBy(worker_id) => query = query.bind(worker_id.to_string()),
            WriteGuard::StatusIn(expected) => {
                for status in expected {
                    query = query.bind(status.as_str());
                }
            }
        }

        let result = query.execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn release_slot(
        conn: &mut SqliteConnection,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE workers SET current_tasks_count = MAX(current_tasks_count - 1, 0), updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(worker_id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 晋升依赖已全部完成的Pending任务
    ///
    /// `dependents_of` 非空时只考虑依赖该任务的记录。
    async fn promote_pending(
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
        dependents_of: Option<Uuid>,
    ) -> SchedulerResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id, dependencies, retry_at FROM tasks WHERE status = 'pending'")
            .fetch_all(&mut *conn)
            .await?;

        let mut candidates: Vec<(Uuid, Vec<Uuid>)> = Vec::new();
        for row in &rows {
            let dependencies: Vec<Uuid> = json_column(row, "dependencies")?;
            if let Some(parent) = dependents_of {
                if !dependencies.contains(&parent) {
                    continue;
                }
            }
            let retry_at: Option<DateTime<Utc>> = row.try_get("retry_at")?;
            if retry_at.map(|at| at > now).unwrap_or(false) {
                continue;
            }
            candidates.push((uuid_column(row, "id")?, dependencies));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let needed: HashSet<Uuid> = candidates
            .iter()
            .flat_map(|(_, deps)| deps.iter().copied())
            .collect();
        let completed = Self::completed_among(conn, &needed).await?;

        let mut promoted = Vec::new();
        for (id, dependencies) in candidates {
            if dependencies.iter().all(|dep| completed.contains(dep)) {
                sqlx::query(
                    "UPDATE tasks SET status = 'ready', retry_at = NULL, updated_at = ? WHERE id = ? AND status = 'pending'",
                )
                .bind(now)
                .bind(id.to_string())
                .execute(&mut *conn)
                .await?;
                promoted.push(id);
            }
        }

        if !promoted.is_empty() {
            debug!("{} 个任务晋升为Ready", promoted.len());
        }
        Ok(promoted)
    }

    async fn completed_among(
        conn: &mut SqliteConnection,
        ids: &HashSet<Uuid>,
    ) -> SchedulerResult<HashSet<Uuid>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id FROM tasks WHERE status = 'completed' AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&mut *conn).await?;
        rows.iter().map(|row| uuid_column(row, "id")).collect()
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut conn = self.pool.acquire().await?;
        Self::insert(&mut conn, task).await?;
        debug!("创建任务成功: {}", task.id);
        Ok(task.clone())
    }

    async fn create_batch(&self, tasks: &[Task]) -> SchedulerResult<()> {
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;
        for task in tasks {
            Self::insert(&mut tx, task).await?;
        }
        tx.commit().await?;
        debug!("批量创建 {} 个任务", tasks.len());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> SchedulerResult<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn update_if_status(
        &self,
        task: &Task,
        expected: &[TaskStatus],
    ) -> SchedulerResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let affected = Self::write_back(&mut conn, task, WriteGuard::StatusIn(expected)).await?;
        Ok(affected > 0)
    }

    async fn list_all(&self) -> SchedulerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_by_status(&self, status: TaskStatus) -> SchedulerResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY created_at");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_by_worker(&self, worker_id: Uuid) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE assigned_worker_id = ? AND status IN ('assigned', 'running')"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn count_by_status(&self) -> SchedulerResult<HashMap<TaskStatus, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            counts.insert(status.parse()?, row.try_get::<i64, _>("count")?);
        }
        Ok(counts)
    }

    async fn promote_ready(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Uuid>> {
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;
        let promoted = Self::promote_pending(&mut tx, now, None).await?;
        tx.commit().await?;
        Ok(promoted)
    }

    async fn try_assign(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;

        let task_updated = sqlx::query(
            r#"
            UPDATE tasks SET status = 'assigned', assigned_worker_id = ?,
                original_worker_id = COALESCE(original_worker_id, ?), updated_at = ?
            WHERE id = ? AND status = 'ready'
            "#,
        )
        .bind(worker_id.to_string())
        .bind(worker_id.to_string())
        .bind(now)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if task_updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let worker_updated = sqlx::query(
            r#"
            UPDATE workers SET current_tasks_count = current_tasks_count + 1, updated_at = ?
            WHERE id = ? AND status = 'active' AND health_status = 'healthy'
                AND current_tasks_count < max_concurrent_tasks
            "#,
        )
        .bind(now)
        .bind(worker_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if worker_updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        debug!("任务 {} 分配给Worker {}", task_id, worker_id);
        Ok(true)
    }

    async fn mark_running(
        &self,
        task_id: Uuid,
        worker_id: Uuid,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE tasks SET status = 'running', started_at = ?, updated_at = ?
            WHERE id = ? AND assigned_worker_id = ? AND status = 'assigned'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(task_id.to_string())
        .bind(worker_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn complete(
        &self,
        task_id: Uuid,
        worker_id: Option<Uuid>,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Vec<Uuid>>> {
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;

        let row = sqlx::query("SELECT status, assigned_worker_id FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        let status: TaskStatus = row.try_get::<String, _>("status")?.parse()?;
        let holder = optional_uuid_column(&row, "assigned_worker_id")?;

        let stale = match worker_id {
            Some(expected) => !status.holds_worker() || holder != Some(expected),
            None => status.is_terminal(),
        };
        if stale {
            tx.rollback().await?;
            return Ok(None);
        }

        let result_json = result.as_ref().map(|r| to_json(r, "任务结果")).transpose()?;
        sqlx::query(
            r#"
            UPDATE tasks SET status = 'completed', result = ?, error_message = NULL,
                retry_at = NULL, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result_json)
        .bind(now)
        .bind(now)
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await?;

        if status.holds_worker() {
            if let Some(holder) = holder {
                Self::release_slot(&mut tx, holder, now).await?;
            }
        }

        let promoted = Self::promote_pending(&mut tx, now, Some(task_id)).await?;
        tx.commit().await?;

        debug!("任务 {} 完成，解锁 {} 个依赖任务", task_id, promoted.len());
        Ok(Some(promoted))
    }

    async fn release(&self, task: &Task, worker_id: Uuid) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin_with(BEGIN_IMMEDIATE).await?;

        let affected = Self::write_back(&mut tx, task, WriteGuard::HeldBy(worker_id)).await?;
        if affected == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::release_slot(&mut tx, worker_id, task.updated_at).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_checkpoint_ref(
        &self,
        task_id: Uuid,
        checkpoint_id: Uuid,
    ) -> SchedulerResult<()> {
        let affected = sqlx::query("UPDATE tasks SET checkpoint_ref = ?, updated_at = ? WHERE id = ?")
            .bind(checkpoint_id.to_string())
            .bind(Utc::now())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        Ok(())
    }

    async fn ping(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}
