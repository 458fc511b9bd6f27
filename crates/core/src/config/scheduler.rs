use serde::{Deserialize, Serialize};

/// 调度循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 调度周期（毫秒）
    pub dispatch_interval_ms: u64,
    /// 单个周期最多分配的任务数
    pub max_dispatch_per_cycle: usize,
    /// 批量提交时是否立即检测间接循环依赖
    pub validate_cycles_on_submit: bool,
    /// 单次远程执行的超时（秒）
    pub execution_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1_000,
            max_dispatch_per_cycle: 100,
            validate_cycles_on_submit: true,
            execution_timeout_seconds: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }
        if self.max_dispatch_per_cycle == 0 {
            return Err(anyhow::anyhow!("单周期最大分配数必须大于0"));
        }
        if self.execution_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("执行超时必须大于0"));
        }
        Ok(())
    }
}

/// Worker健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// 心跳TTL（秒），超过一半视为降级，超过全部视为不健康
    pub heartbeat_ttl_seconds: u64,
    /// 健康巡检间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 单次探测超时（秒）
    pub probe_timeout_seconds: u64,
    /// 未配置时使用的HTTP健康检查路径
    pub default_health_endpoint: String,
    /// 心跳指标中任一资源使用率超过该值时降级（百分比）
    pub resource_pressure_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: 90,
            sweep_interval_seconds: 30,
            probe_timeout_seconds: 5,
            default_health_endpoint: "/health".to_string(),
            resource_pressure_threshold: 90.0,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_ttl_seconds < 2 {
            return Err(anyhow::anyhow!("心跳TTL至少为2秒"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("健康巡检间隔必须大于0"));
        }
        if self.probe_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("探测超时必须大于0"));
        }
        if !self.default_health_endpoint.starts_with('/') {
            return Err(anyhow::anyhow!(
                "健康检查路径必须以/开头: {}",
                self.default_health_endpoint
            ));
        }
        if !(0.0..=100.0).contains(&self.resource_pressure_threshold) {
            return Err(anyhow::anyhow!("资源压力阈值必须在0到100之间"));
        }
        Ok(())
    }
}

/// 检查点写入配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// 单次写入超时（秒）
    pub write_timeout_seconds: u64,
    /// 写入最多尝试次数
    pub save_attempts: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            write_timeout_seconds: 5,
            save_attempts: 3,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.write_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("检查点写入超时必须大于0"));
        }
        if self.save_attempts == 0 {
            return Err(anyhow::anyhow!("检查点写入尝试次数必须大于0"));
        }
        Ok(())
    }
}
