use serde::{Deserialize, Serialize};

/// Output format for log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(anyhow::anyhow!("不支持的日志格式: {other}")),
        }
    }
}

/// Logging configuration
///
/// `RUST_LOG` takes precedence over `level` when the subscriber is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum log level or an `EnvFilter` directive string
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        // 允许 "info,taskmesh_dispatcher=debug" 形式的指令
        let base = self.level.split(',').next().unwrap_or_default().trim();
        if base.contains('=') {
            return Ok(());
        }
        if !LEVELS.contains(&base.to_ascii_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.level));
        }
        Ok(())
    }
}
