use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{Checkpoint, Worker},
    SchedulerResult,
};

/// 发送给Worker的执行请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// 第几次执行，首次为1
    pub attempt: i32,
    /// 从检查点恢复执行
    pub checkpoint: Option<Checkpoint>,
}

/// 在Worker上执行任务的能力，每种传输方式一个实现
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    /// 执行任务并等待结果
    async fn dispatch(
        &self,
        worker: &Worker,
        request: DispatchRequest,
    ) -> SchedulerResult<serde_json::Value>;

    /// 尽力通知Worker取消任务
    async fn cancel(&self, _worker: &Worker, _task_id: Uuid) -> SchedulerResult<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// 标准健康RPC的返回状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingStatus {
    Serving,
    NotServing,
    Unknown,
}

/// 由网络层提供的RPC健康检查客户端
#[async_trait]
pub trait RpcHealthClient: Send + Sync {
    async fn check(&self, address: &str) -> SchedulerResult<ServingStatus>;
}
