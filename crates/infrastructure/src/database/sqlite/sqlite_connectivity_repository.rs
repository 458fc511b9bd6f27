use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use taskmesh_core::{
    models::ConnectivityEvent, traits::ConnectivityEventRepository, SchedulerResult,
};

use crate::database::mapping::{json_column, to_json, uuid_column};

pub struct SqliteConnectivityEventRepository {
    pool: SqlitePool,
}

impl SqliteConnectivityEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &SqliteRow) -> SchedulerResult<ConnectivityEvent> {
        let kind: String = row.try_get("event_type")?;
        Ok(ConnectivityEvent {
            id: uuid_column(row, "id")?,
            worker_id: uuid_column(row, "worker_id")?,
            kind: kind.parse()?,
            data: json_column(row, "event_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ConnectivityEventRepository for SqliteConnectivityEventRepository {
    async fn record(&self, event: &ConnectivityEvent) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_connectivity_events (id, worker_id, event_type, event_data, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.worker_id.to_string())
        .bind(event.kind.as_str())
        .bind(to_json(&event.data, "事件数据")?)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_worker(
        &self,
        worker_id: Uuid,
        limit: i64,
    ) -> SchedulerResult<Vec<ConnectivityEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, worker_id, event_type, event_data, created_at
            FROM worker_connectivity_events
            WHERE worker_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(worker_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }
}
