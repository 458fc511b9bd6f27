pub mod sqlite_checkpoint_repository;
pub mod sqlite_connectivity_repository;
pub mod sqlite_task_repository;
pub mod sqlite_worker_repository;

pub use sqlite_checkpoint_repository::SqliteCheckpointRepository;
pub use sqlite_connectivity_repository::SqliteConnectivityEventRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_worker_repository::SqliteWorkerRepository;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use taskmesh_core::config::DatabaseConfig;
use tracing::info;

use super::migrations::run_migrations;

/// 权威存储：一个SQLite连接池加上各表的仓储
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 按配置打开数据库并运行迁移
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("初始化SQLite数据库: {}", config.url);

        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .context("解析数据库URL失败")?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存库每个连接是独立的数据库，只能使用单连接且不能回收
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .context("创建数据库连接池失败")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// 单连接内存数据库，主要用于测试
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn migrate(&self) -> Result<()> {
        run_migrations(&self.pool)
            .await
            .context("运行数据库迁移失败")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn task_repository(&self) -> Arc<SqliteTaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn worker_repository(&self) -> Arc<SqliteWorkerRepository> {
        Arc::new(SqliteWorkerRepository::new(self.pool.clone()))
    }

    pub fn checkpoint_repository(&self) -> Arc<SqliteCheckpointRepository> {
        Arc::new(SqliteCheckpointRepository::new(self.pool.clone()))
    }

    pub fn connectivity_repository(&self) -> Arc<SqliteConnectivityEventRepository> {
        Arc::new(SqliteConnectivityEventRepository::new(self.pool.clone()))
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("数据库健康检查失败")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
