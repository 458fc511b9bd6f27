use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use taskmesh_core::{
    models::{Worker, WorkerHealth, WorkerMetrics, WorkerStatus},
    traits::WorkerRepository,
    SchedulerError, SchedulerResult,
};

use crate::database::mapping::{json_column, optional_json_column, to_json, uuid_column};

const WORKER_COLUMNS: &str = "id, hostname, transport_config, capabilities, resources, status, \
    health_status, last_heartbeat, current_tasks_count, max_concurrent_tasks, \
    consecutive_probe_failures, metrics, registered_at, updated_at";

pub struct SqliteWorkerRepository {
    pool: SqlitePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &SqliteRow) -> SchedulerResult<Worker> {
        let status: String = row.try_get("status")?;
        let health: String = row.try_get("health_status")?;

        Ok(Worker {
            id: uuid_column(row, "id")?,
            hostname: row.try_get("hostname")?,
            transport: json_column(row, "transport_config")?,
            capabilities: json_column(row, "capabilities")?,
            resources: json_column(row, "resources")?,
            status: status.parse()?,
            health: health.parse()?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            current_tasks_count: row.try_get("current_tasks_count")?,
            max_concurrent_tasks: row.try_get("max_concurrent_tasks")?,
            consecutive_probe_failures: row.try_get("consecutive_probe_failures")?,
            metrics: optional_json_column(row, "metrics")?,
            registered_at: row.try_get("registered_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for SqliteWorkerRepository {
    async fn create(&self, worker: &Worker) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, transport_config, capabilities, resources, status,
                health_status, last_heartbeat, current_tasks_count, max_concurrent_tasks,
                consecutive_probe_failures, metrics, registered_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(worker.id.to_string())
        .bind(&worker.hostname)
        .bind(to_json(&worker.transport, "传输配置")?)
        .bind(to_json(&worker.capabilities, "能力标签")?)
        .bind(to_json(&worker.resources, "资源声明")?)
        .bind(worker.status.as_str())
        .bind(worker.health.as_str())
        .bind(worker.last_heartbeat)
        .bind(worker.current_tasks_count)
        .bind(worker.max_concurrent_tasks)
        .bind(worker.consecutive_probe_failures)
        .bind(worker.metrics.as_ref().map(|m| to_json(m, "资源指标")).transpose()?)
        .bind(worker.registered_at)
        .bind(worker.updated_at)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        debug!("注册Worker成功: {} ({})", worker.id, worker.hostname);
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn find_by_hostname(&self, hostname: &str) -> SchedulerResult<Option<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE hostname = ?");
        let row = sqlx::query(&sql)
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn update(&self, worker: &Worker) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workers SET hostname = ?, transport_config = ?, capabilities = ?,
                resources = ?, status = ?, health_status = ?, last_heartbeat = ?,
                max_concurrent_tasks = ?, consecutive_probe_failures = ?, metrics = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&worker.hostname)
        .bind(to_json(&worker.transport, "传输配置")?)
        .bind(to_json(&worker.capabilities, "能力标签")?)
        .bind(to_json(&worker.resources, "资源声明")?)
        .bind(worker.status.as_str())
        .bind(worker.health.as_str())
        .bind(worker.last_heartbeat)
        .bind(worker.max_concurrent_tasks)
        .bind(worker.consecutive_probe_failures)
        .bind(worker.metrics.as_ref().map(|m| to_json(m, "资源指标")).transpose()?)
        .bind(worker.updated_at)
        .bind(worker.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound { id: worker.id });
        }
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
        let result = sqlx::query(
            r#"
            UPDATE workers SET
                last_heartbeat = CASE
                    WHEN last_heartbeat IS NULL OR julianday(last_heartbeat) < julianday(?) THEN ?
                    ELSE last_heartbeat END,
                metrics = COALESCE(?, metrics),
                health_status = CASE
                    WHEN ? AND health_status = 'healthy' THEN 'degraded'
                    ELSE health_status END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(metrics.map(|m| to_json(m, "资源指标")).transpose()?)
        .bind(degrade)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_health(
        &self,
        id: Uuid,
        health: WorkerHealth,
        consecutive_failures: i32,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET health_status = ?, consecutive_probe_failures = ?, updated_at = ? WHERE id = ?",
        )
        .bind(health.as_str())
        .bind(consecutive_failures)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: WorkerStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE workers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> SchedulerResult<Vec<Worker>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn delete(&self, id: Uuid) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

        debug!("注销Worker: {}", id);
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use chrono::Utc;
    use taskmesh_core::models::{
        ProbeProtocol, Resources, TransportConfig, WorkerHealth, WorkerMetrics,
        WorkerRegistration, WorkerStatus,
    };

    fn registration(hostname: &str) -> WorkerRegistration {
        WorkerRegistration {
            hostname: hostname.to_string(),
            transport: TransportConfig {
                protocol: ProbeProtocol::Http,
                address: "10.0.0.5:8080".to_string(),
                health_endpoint: Some("/healthz".to_string()),
            },
            capabilities: vec!["rust".to_string()],
            resources: Resources {
                cpu_count: 8,
                total_memory: 16 << 30,
                ..Default::default()
            },
            max_concurrent_tasks: 4,
        }
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-01").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();

        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.hostname, "build-01");
        assert_eq!(loaded.transport.health_endpoint.as_deref(), Some("/healthz"));
        assert_eq!(loaded.resources.cpu_count, 8);
        assert_eq!(loaded.health, WorkerHealth::Unknown);

        let by_host = repo.find_by_hostname("build-01").await.unwrap().unwrap();
        assert_eq!(by_host.id, worker.id);
    }

    #[tokio::test]
    async fn test_update_does_not_touch_load() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-02").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();
        sqlx::query("UPDATE workers SET current_tasks_count = 3 WHERE id = ?")
            .bind(worker.id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let mut changed = worker.clone();
        changed.status = WorkerStatus::Maintenance;
        changed.current_tasks_count = 0;
        changed.metrics = Some(WorkerMetrics {
            cpu_usage: 12.5,
            ..Default::default()
        });
        repo.update(&changed).await.unwrap();

        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkerStatus::Maintenance);
        assert_eq!(loaded.current_tasks_count, 3);
        assert_eq!(loaded.metrics.unwrap().cpu_usage, 12.5);
    }

    #[tokio::test]
    async fn test_heartbeat_never_moves_backwards() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-04").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();

        let now = Utc::now();
        let metrics = WorkerMetrics {
            cpu_usage: 40.0,
            ..Default::default()
        };
        assert!(repo
            .record_heartbeat(worker.id, now, Some(&metrics), false, now)
            .await
            .unwrap());
        let older = now - chrono::Duration::seconds(30);
        assert!(repo
            .record_heartbeat(worker.id, older, None, false, now)
            .await
            .unwrap());

        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_heartbeat.unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
        assert_eq!(loaded.metrics.unwrap().cpu_usage, 40.0);
        assert!(!repo
            .record_heartbeat(Uuid::new_v4(), now, None, false, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_degrades_only_healthy_workers() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-05").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();
        let now = Utc::now();

        repo.update_health(worker.id, WorkerHealth::Unhealthy, 3, now)
            .await
            .unwrap();
        repo.record_heartbeat(worker.id, now, None, true, now)
            .await
            .unwrap();
        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.health, WorkerHealth::Unhealthy);
        assert_eq!(loaded.consecutive_probe_failures, 3);

        repo.update_health(worker.id, WorkerHealth::Healthy, 0, now)
            .await
            .unwrap();
        repo.record_heartbeat(worker.id, now, None, true, now)
            .await
            .unwrap();
        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.health, WorkerHealth::Degraded);
    }

    #[tokio::test]
    async fn test_health_and_status_writes_keep_heartbeat() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-06").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();

        let beat = Utc::now() + chrono::Duration::seconds(5);
        repo.record_heartbeat(worker.id, beat, None, false, beat)
            .await
            .unwrap();
        repo.update_health(worker.id, WorkerHealth::Healthy, 0, Utc::now())
            .await
            .unwrap();
        repo.update_status(worker.id, WorkerStatus::Maintenance, Utc::now())
            .await
            .unwrap();

        let loaded = repo.get_by_id(worker.id).await.unwrap().unwrap();
        assert_eq!(loaded.health, WorkerHealth::Healthy);
        assert_eq!(loaded.status, WorkerStatus::Maintenance);
        assert_eq!(
            loaded.last_heartbeat.unwrap().timestamp_millis(),
            beat.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_delete_and_missing_update() {
        let store = SqliteStore::in_memory().await.unwrap();
        let repo = SqliteWorkerRepository::new(store.pool().clone());
        let worker = registration("build-03").into_worker(Utc::now());
        repo.create(&worker).await.unwrap();

        assert!(repo.delete(worker.id).await.unwrap());
        assert!(!repo.delete(worker.id).await.unwrap());
        assert!(matches!(
            repo.update(&worker).await,
            Err(SchedulerError::WorkerNotFound { .. })
        ));
    }
}
