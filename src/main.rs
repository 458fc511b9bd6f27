use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};

use taskmesh::app::Application;
use taskmesh::shutdown::ShutdownManager;
use taskmesh::telemetry::{init_logging, install_metrics_exporter};
use taskmesh_core::{AppConfig, LogFormat};

fn cli() -> Command {
    Command::new("taskmesh")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式任务调度与Worker健康管理")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("run").about("启动调度循环和健康巡检"))
        .subcommand(Command::new("validate-config").about("加载并校验配置后退出"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;
    apply_log_overrides(&mut config, &matches)?;

    match matches.subcommand() {
        Some(("validate-config", _)) => {
            println!("配置有效");
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Some(("run", _)) => run(config).await,
        Some((other, _)) => Err(anyhow::anyhow!("未知的子命令: {other}")),
        None => Err(anyhow::anyhow!("缺少子命令")),
    }
}

fn apply_log_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log.format = LogFormat::parse(format)?;
    }
    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    init_logging(&config.observability.log)?;
    install_metrics_exporter(&config.observability)?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!("启动TaskMesh，主机: {host}，数据库: {}", config.database.url);

    let app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown = shutdown_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 应用内部已有宽限期，这里再留一点余量
    match tokio::time::timeout(Duration::from_secs(65), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("TaskMesh已退出");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
