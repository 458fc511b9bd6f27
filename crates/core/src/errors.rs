use thiserror::Error;
use uuid::Uuid;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: Uuid },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: Uuid },

    #[error("任务 {task_id} 没有检查点")]
    CheckpointNotFound { task_id: Uuid },

    #[error("任务 {id} 不能依赖自身")]
    SelfDependency { id: Uuid },

    #[error("任务 {task_id} 依赖未知任务 {dependency_id}")]
    UnknownDependency { task_id: Uuid, dependency_id: Uuid },

    #[error("检测到循环依赖: {tasks:?}")]
    CircularDependency { tasks: Vec<Uuid> },

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("无效的状态转换: {0}")]
    InvalidStateTransition(String),

    #[error("检查点版本过旧: 任务 {task_id} 当前版本 {latest}，写入版本 {attempted}")]
    StaleCheckpoint {
        task_id: Uuid,
        latest: i64,
        attempted: i64,
    },

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("连接被拒绝: {0}")]
    ConnectionRefused(String),

    #[error("连接被重置: {0}")]
    ConnectionReset(String),

    #[error("请求被限流: {0}")]
    RateLimited(String),

    #[error("上游返回状态码 {0}")]
    UpstreamStatus(u16),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务已取消: {id}")]
    Cancelled { id: Uuid },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误分类，决定错误由哪一层处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 可重试的瞬时错误
    Transient,
    /// 任务级终止错误，不重试
    Terminal,
    /// Worker失联，由检查点重分配处理
    WorkerLoss,
    /// 权威存储故障，整个子系统进入降级模式
    Store,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Terminal => "terminal",
            ErrorCategory::WorkerLoss => "worker_loss",
            ErrorCategory::Store => "store",
        }
    }
}

impl SchedulerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SchedulerError::Database(e) => match e {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::WorkerCrashed => ErrorCategory::Store,
                sqlx::Error::Database(db) if is_lock_contention(db.code().as_deref()) => {
                    ErrorCategory::Store
                }
                _ => ErrorCategory::Terminal,
            },
            SchedulerError::StoreUnavailable(_) => ErrorCategory::Store,
            SchedulerError::Timeout(_)
            | SchedulerError::ConnectionRefused(_)
            | SchedulerError::ConnectionReset(_)
            | SchedulerError::RateLimited(_) => ErrorCategory::Transient,
            SchedulerError::UpstreamStatus(code) if matches!(code, 502..=504) => {
                ErrorCategory::Transient
            }
            SchedulerError::WorkerNotFound { .. } => ErrorCategory::WorkerLoss,
            _ => ErrorCategory::Terminal,
        }
    }

    /// 是否为权威存储故障
    pub fn is_store_failure(&self) -> bool {
        self.category() == ErrorCategory::Store
    }
}

/// SQLITE_BUSY/SQLITE_LOCKED及其扩展码，低8位为主错误码
fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_transient() {
        assert_eq!(
            SchedulerError::Timeout("heartbeat".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            SchedulerError::UpstreamStatus(503).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            SchedulerError::UpstreamStatus(500).category(),
            ErrorCategory::Terminal
        );
    }

    #[test]
    fn test_store_errors() {
        assert!(SchedulerError::Database(sqlx::Error::PoolTimedOut).is_store_failure());
        assert!(SchedulerError::StoreUnavailable("down".into()).is_store_failure());
        assert!(!SchedulerError::Database(sqlx::Error::RowNotFound).is_store_failure());
    }

    #[derive(Debug)]
    struct FakeSqliteError(&'static str);

    impl std::fmt::Display for FakeSqliteError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlite error {}", self.0)
        }
    }

    impl std::error::Error for FakeSqliteError {}

    impl sqlx::error::DatabaseError for FakeSqliteError {
        fn message(&self) -> &str {
            "database is locked"
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.0.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn database_error(code: &'static str) -> SchedulerError {
        SchedulerError::Database(sqlx::Error::Database(Box::new(FakeSqliteError(code))))
    }

    #[test]
    fn test_busy_and_locked_are_store_failures() {
        // BUSY、LOCKED、BUSY_SNAPSHOT、LOCKED_SHAREDCACHE
        for code in ["5", "6", "517", "262"] {
            assert_eq!(database_error(code).category(), ErrorCategory::Store, "{code}");
        }
        // UNIQUE约束冲突仍是终止错误
        assert_eq!(database_error("2067").category(), ErrorCategory::Terminal);
        assert_eq!(database_error("not-a-number").category(), ErrorCategory::Terminal);
    }
}
