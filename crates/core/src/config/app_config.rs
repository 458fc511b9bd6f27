use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    observability::ObservabilityConfig,
    scheduler::{CheckpointConfig, HealthConfig, SchedulerConfig},
};
use crate::retry::RetryConfig;

const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/taskmesh.toml",
    "taskmesh.toml",
    "/etc/taskmesh/config.toml",
];

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
    pub checkpoint: CheckpointConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults
    /// 2. Config file (TOML format), explicit path or first existing default path
    /// 3. Environment variable overrides (`TASKMESH_SECTION__KEY`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKMESH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.health.validate().context("健康检查配置验证失败")?;
        self.retry.validate().context("重试策略配置验证失败")?;
        self.checkpoint.validate().context("检查点配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.heartbeat_ttl_seconds, 90);
        assert_eq!(config.health.probe_timeout_seconds, 5);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.database.url, config.database.url);
        assert_eq!(
            parsed.health.default_health_endpoint,
            config.health.default_health_endpoint
        );
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[health]
heartbeat_ttl_seconds = 20

[scheduler]
max_dispatch_per_cycle = 7
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.health.heartbeat_ttl_seconds, 20);
        assert_eq!(config.health.sweep_interval_seconds, 30);
        assert_eq!(config.scheduler.max_dispatch_per_cycle, 7);
        assert_eq!(config.retry.initial_backoff_ms, 1_000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/taskmesh.toml")).is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.database.url = "postgres://localhost/db".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.health.default_health_endpoint = "health".to_string();
        assert!(config.validate().is_err());
    }
}
