use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use taskmesh_core::{config::ObservabilityConfig, LogConfig, LogFormat};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，`RUST_LOG` 优先于配置中的级别
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}

/// 按配置安装Prometheus导出器，未启用时不做任何事
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_listen_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_listen_address))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus导出器失败")?;

    info!("Prometheus指标导出监听于 {}", addr);
    Ok(())
}
