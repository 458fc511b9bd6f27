//! 配置模型与加载
//!
//! 默认值 < TOML配置文件 < `TASKMESH_` 前缀环境变量。

pub mod app_config;
pub mod database;
pub mod observability;
pub mod scheduler;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use observability::ObservabilityConfig;
pub use scheduler::{CheckpointConfig, HealthConfig, SchedulerConfig};
