//! Worker health state machine
//!
//! Pure transition rules shared by the heartbeat path and the periodic sweep.

use chrono::Duration;
use taskmesh_core::models::WorkerHealth;

/// 单次评估的输入
#[derive(Debug, Clone)]
pub struct HealthInputs {
    pub current: WorkerHealth,
    /// 本轮探测是否成功
    pub probe_ok: bool,
    /// 距上次心跳的时长，从未收到心跳时为 `None`
    pub heartbeat_age: Option<Duration>,
    pub heartbeat_ttl: Duration,
    /// 含本轮在内的连续探测失败次数
    pub consecutive_failures: i32,
    /// 最近一次心跳上报的资源使用率超过阈值
    pub under_pressure: bool,
}

/// 连续失败达到该次数后判定为不健康
pub const UNHEALTHY_FAILURE_THRESHOLD: i32 = 2;

impl HealthInputs {
    fn age_exceeds(&self, limit: Duration) -> bool {
        self.heartbeat_age.map(|age| age > limit).unwrap_or(true)
    }

    fn age_at_least(&self, limit: Duration) -> bool {
        self.heartbeat_age.map(|age| age >= limit).unwrap_or(true)
    }
}

/// 计算下一个健康状态
///
/// 任何状态在探测成功、心跳新鲜且没有资源压力时恢复为Healthy。Healthy一次
/// 评估最多降到Degraded，不会直接变为Unhealthy。
pub fn evaluate(inputs: &HealthInputs) -> WorkerHealth {
    let half_ttl = inputs.heartbeat_ttl / 2;
    let fresh = !inputs.age_at_least(half_ttl);

    if inputs.probe_ok && fresh && !inputs.under_pressure {
        return WorkerHealth::Healthy;
    }

    let expired = inputs.age_exceeds(inputs.heartbeat_ttl)
        || inputs.consecutive_failures >= UNHEALTHY_FAILURE_THRESHOLD;

    match inputs.current {
        WorkerHealth::Healthy => WorkerHealth::Degraded,
        WorkerHealth::Unknown => {
            if expired {
                WorkerHealth::Unhealthy
            } else if !inputs.probe_ok || inputs.age_exceeds(half_ttl) || inputs.under_pressure {
                WorkerHealth::Degraded
            } else {
                WorkerHealth::Unknown
            }
        }
        WorkerHealth::Degraded => {
            if expired {
                WorkerHealth::Unhealthy
            } else {
                WorkerHealth::Degraded
            }
        }
        WorkerHealth::Unhealthy => WorkerHealth::Unhealthy,
    }
}
