//! Timeout handling for calls that leave the process
//!
//! Health probes and checkpoint writes are bounded so a hung worker or a
//! slow store cannot stall the health sweep or the dispatch loop.

use std::future::Future;
use std::time::Duration;

use taskmesh_core::config::{CheckpointConfig, HealthConfig};
use taskmesh_core::{SchedulerError, SchedulerResult};
use tokio::time::timeout;
use tracing::{instrument, warn};

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// 单次健康探测的上限
    pub probe_timeout: Duration,
    /// 单次检查点写入的上限
    pub checkpoint_write_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            checkpoint_write_timeout: Duration::from_secs(5),
        }
    }
}

impl TimeoutConfig {
    pub fn from_configs(health: &HealthConfig, checkpoint: &CheckpointConfig) -> Self {
        Self {
            probe_timeout: Duration::from_secs(health.probe_timeout_seconds),
            checkpoint_write_timeout: Duration::from_secs(checkpoint.write_timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TimeoutHandler {
    config: TimeoutConfig,
}

impl TimeoutHandler {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    #[instrument(skip(self, operation))]
    pub async fn probe<F, T>(&self, operation: F, target: &str) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        Self::run(operation, self.config.probe_timeout, "健康探测", target).await
    }

    #[instrument(skip(self, operation))]
    pub async fn checkpoint_write<F, T>(&self, operation: F, task: &str) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        Self::run(operation, self.config.checkpoint_write_timeout, "检查点写入", task).await
    }

    /// 超时映射为可重试的 `SchedulerError::Timeout`
    pub async fn run<F, T>(
        operation: F,
        limit: Duration,
        operation_type: &str,
        operation_name: &str,
    ) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        match timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("{operation_type} '{operation_name}' 超时 (超时时间: {limit:?})");
                warn!("{}", message);
                Err(SchedulerError::Timeout(message))
            }
        }
    }
}
