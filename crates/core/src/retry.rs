use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    errors::{ErrorCategory, SchedulerError},
    models::RetryStats,
    SchedulerResult,
};

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 首次重试间隔（毫秒）
    pub initial_backoff_ms: u64,
    /// 指数退避倍数
    pub backoff_factor: f64,
    /// 最大重试间隔（毫秒）
    pub max_backoff_ms: u64,
    /// `execute` 包装的操作最多尝试次数（含首次）
    pub max_attempts: u32,
    /// 重试间隔的随机抖动范围（0.0-1.0），只作用于实际等待，不影响 `next_backoff`
    pub jitter_factor: f64,
    /// 新任务未指定时的最大重试次数
    pub default_task_max_retries: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            backoff_factor: 2.0,
            max_backoff_ms: 30_000,
            max_attempts: 3,
            jitter_factor: 0.0,
            default_task_max_retries: 3,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_backoff_ms == 0 {
            return Err(anyhow::anyhow!("首次重试间隔必须大于0"));
        }
        if self.backoff_factor < 1.0 {
            return Err(anyhow::anyhow!(
                "退避倍数不能小于1.0: {}",
                self.backoff_factor
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于首次重试间隔"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("最大尝试次数必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动范围必须在0.0到1.0之间: {}",
                self.jitter_factor
            ));
        }
        if self.default_task_max_retries < 0 {
            return Err(anyhow::anyhow!("任务最大重试次数不能为负数"));
        }
        Ok(())
    }
}

/// 重试策略
///
/// 同时用于任务执行失败的重排队和瞬时通信错误的本地重试。按操作名统计尝试、
/// 成功、失败和重试次数。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    stats: Arc<Mutex<HashMap<String, RetryStats>>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RetryPolicy {
    pub fn new(config: Option<RetryConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// 未分类的错误一律不重试
    pub fn is_retryable(&self, error: &SchedulerError) -> bool {
        error.category() == ErrorCategory::Transient
    }

    /// `min(initial * factor^attempt, max)`
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_backoff_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = (initial * self.config.backoff_factor.powi(exponent))
            .min(self.config.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// 带抖动的实际等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.next_backoff(attempt);
        if self.config.jitter_factor <= 0.0 {
            return base;
        }
        let jitter = self.config.jitter_factor;
        let scale = 1.0 + rand::rng().random_range(-jitter..=jitter);
        Duration::from_millis((base.as_millis() as f64 * scale).max(0.0) as u64)
    }

    /// 以本策略执行一个可能瞬时失败的操作
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.with_stats(operation, |s| s.attempts += 1);

            match f().await {
                Ok(value) => {
                    self.with_stats(operation, |s| s.successes += 1);
                    return Ok(value);
                }
                Err(e) if self.is_retryable(&e) && attempt + 1 < self.config.max_attempts => {
                    let delay = self.delay_for(attempt);
                    self.with_stats(operation, |s| s.retries += 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "操作失败，准备重试: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.with_stats(operation, |s| s.failures += 1);
                    debug!(operation, attempt, "操作最终失败: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// 记录一次由调用方自行处理的重试结果
    pub fn record(&self, operation: &str, outcome: RetryOutcome) {
        self.with_stats(operation, |s| match outcome {
            RetryOutcome::Success => {
                s.attempts += 1;
                s.successes += 1;
            }
            RetryOutcome::Retried => {
                s.attempts += 1;
                s.retries += 1;
            }
            RetryOutcome::Failed => {
                s.attempts += 1;
                s.failures += 1;
            }
        });
    }

    pub fn stats(&self) -> BTreeMap<String, RetryStats> {
        self.lock_stats()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn stats_for(&self, operation: &str) -> RetryStats {
        self.lock_stats()
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    fn with_stats(&self, operation: &str, update: impl FnOnce(&mut RetryStats)) {
        let mut stats = self.lock_stats();
        update(stats.entry(operation.to_string()).or_default());
    }

    fn lock_stats(&self) -> MutexGuard<'_, HashMap<String, RetryStats>> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 调用方自行执行重试时上报的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Success,
    Retried,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Some(RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            max_attempts,
            ..Default::default()
        }))
    }

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|n| policy.next_backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30]);
        assert_eq!(policy.next_backoff(200), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(Some(RetryConfig {
            jitter_factor: 0.5,
            ..Default::default()
        }));
        for _ in 0..50 {
            let delay = policy.delay_for(2).as_millis();
            assert!((2_000..=6_000).contains(&delay));
        }
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&SchedulerError::ConnectionRefused("x".into())));
        assert!(policy.is_retryable(&SchedulerError::ConnectionReset("x".into())));
        assert!(policy.is_retryable(&SchedulerError::RateLimited("x".into())));
        assert!(policy.is_retryable(&SchedulerError::UpstreamStatus(504)));
        assert!(!policy.is_retryable(&SchedulerError::TaskExecution("boom".into())));
        assert!(!policy.is_retryable(&SchedulerError::Internal("?".into())));
    }

    #[tokio::test]
    async fn test_execute_retries_transient_errors() {
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy
            .execute("checkpoint_save", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SchedulerError::Timeout("slow store".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        let stats = policy.stats_for("checkpoint_save");
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_on_terminal_error() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: SchedulerResult<()> = policy
            .execute("dispatch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::TaskExecution("bad input".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(policy.stats_for("dispatch").failures, 1);
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_attempts() {
        let policy = fast_policy(2);
        let result: SchedulerResult<()> = policy
            .execute("probe", || async {
                Err(SchedulerError::ConnectionRefused("down".into()))
            })
            .await;

        assert!(matches!(result, Err(SchedulerError::ConnectionRefused(_))));
        let stats = policy.stats_for("probe");
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        let bad = RetryConfig {
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
