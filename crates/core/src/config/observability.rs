use serde::{Deserialize, Serialize};

use crate::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log: LogConfig,
    pub metrics_enabled: bool,
    /// Prometheus导出监听地址
    pub metrics_listen_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            metrics_enabled: false,
            metrics_listen_address: "0.0.0.0:9464".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.log.validate()?;
        if self.metrics_enabled {
            self.metrics_listen_address
                .parse::<std::net::SocketAddr>()
                .map_err(|e| {
                    anyhow::anyhow!(
                        "无效的指标监听地址 {}: {e}",
                        self.metrics_listen_address
                    )
                })?;
        }
        Ok(())
    }
}
