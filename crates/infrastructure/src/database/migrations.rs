use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

/// 建表语句，按顺序执行，全部幂等
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "创建任务表失败",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            task_type TEXT NOT NULL,
            data TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            criticality TEXT NOT NULL DEFAULT 'normal',
            dependencies TEXT NOT NULL DEFAULT '[]',
            required_capabilities TEXT NOT NULL DEFAULT '[]',
            assigned_worker_id TEXT,
            original_worker_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            error_message TEXT,
            result TEXT,
            checkpoint_ref TEXT,
            estimated_duration_secs INTEGER,
            retry_at TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "创建任务状态索引失败",
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
    ),
    (
        "创建任务Worker索引失败",
        "CREATE INDEX IF NOT EXISTS idx_tasks_assigned_worker ON tasks(assigned_worker_id)",
    ),
    (
        "创建Worker表失败",
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            id TEXT PRIMARY KEY,
            hostname TEXT NOT NULL UNIQUE,
            transport_config TEXT NOT NULL,
            capabilities TEXT NOT NULL DEFAULT '[]',
            resources TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL,
            health_status TEXT NOT NULL,
            last_heartbeat TEXT,
            current_tasks_count INTEGER NOT NULL DEFAULT 0 CHECK (current_tasks_count >= 0),
            max_concurrent_tasks INTEGER NOT NULL,
            consecutive_probe_failures INTEGER NOT NULL DEFAULT 0,
            metrics TEXT,
            registered_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "创建Worker健康索引失败",
        "CREATE INDEX IF NOT EXISTS idx_workers_health ON workers(status, health_status)",
    ),
    (
        "创建检查点表失败",
        r#"
        CREATE TABLE IF NOT EXISTS task_checkpoints (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks (id),
            worker_id TEXT NOT NULL,
            checkpoint_name TEXT,
            version INTEGER NOT NULL,
            checkpoint_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (task_id, version)
        )
        "#,
    ),
    (
        "创建连接事件表失败",
        r#"
        CREATE TABLE IF NOT EXISTS worker_connectivity_events (
            id TEXT PRIMARY KEY,
            worker_id TEXT NOT NULL,
            event_type TEXT NOT NULL CHECK (
                event_type IN ('connected', 'disconnected', 'reconnected', 'heartbeat_missed')
            ),
            event_data TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "创建连接事件索引失败",
        "CREATE INDEX IF NOT EXISTS idx_connectivity_worker ON worker_connectivity_events(worker_id, created_at)",
    ),
];

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("运行数据库迁移");

    for (failure, statement) in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context(*failure)?;
    }

    info!("数据库迁移完成");
    Ok(())
}
