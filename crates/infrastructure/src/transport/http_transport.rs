use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use taskmesh_core::{
    models::{ProbeProtocol, Worker},
    traits::{DispatchRequest, ExecutionTransport},
    SchedulerError, SchedulerResult,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 通过HTTP把任务交给Worker执行
///
/// 请求体为 `DispatchRequest` 的JSON，发送到 `{scheme}://{address}/tasks/execute`，
/// 2xx响应体作为任务结果。
pub struct HttpExecutionTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpExecutionTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    fn base_url(worker: &Worker) -> String {
        let scheme = match worker.transport.protocol {
            ProbeProtocol::Https => "https",
            _ => "http",
        };
        format!("{scheme}://{}", worker.transport.address)
    }

    /// 把reqwest错误映射到调度器的错误分类
    pub fn map_request_error(error: reqwest::Error) -> SchedulerError {
        if error.is_timeout() {
            return SchedulerError::Timeout(error.to_string());
        }
        if error.is_connect() {
            return SchedulerError::ConnectionRefused(error.to_string());
        }

        let mut source = error.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                        return SchedulerError::ConnectionReset(error.to_string());
                    }
                    std::io::ErrorKind::ConnectionRefused => {
                        return SchedulerError::ConnectionRefused(error.to_string());
                    }
                    std::io::ErrorKind::TimedOut => {
                        return SchedulerError::Timeout(error.to_string());
                    }
                    _ => {}
                }
            }
            source = cause.source();
        }
        SchedulerError::Network(error.to_string())
    }

    /// 非2xx状态码的映射
    pub fn map_status(status: StatusCode, body: &str) -> SchedulerError {
        match status.as_u16() {
            429 => SchedulerError::RateLimited(body.to_string()),
            code @ 502..=504 => SchedulerError::UpstreamStatus(code),
            code => SchedulerError::TaskExecution(format!("HTTP {code}: {body}")),
        }
    }
}

#[async_trait]
impl ExecutionTransport for HttpExecutionTransport {
    #[instrument(skip(self, worker, request), fields(worker = %worker.hostname, task_id = %request.task_id))]
    async fn dispatch(
        &self,
        worker: &Worker,
        request: DispatchRequest,
    ) -> SchedulerResult<serde_json::Value> {
        let url = format!("{}/tasks/execute", Self::base_url(worker));
        info!("派发任务到Worker: {} (第{}次尝试)", url, request.attempt);

        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Worker返回错误状态: {} - {}", status, body);
            return Err(Self::map_status(status, &body));
        }

        let body = response.text().await.map_err(Self::map_request_error)?;
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn cancel(&self, worker: &Worker, task_id: Uuid) -> SchedulerResult<()> {
        let url = format!("{}/tasks/{task_id}/cancel", Self::base_url(worker));
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Self::map_status(status, "取消请求被拒绝"));
        }
        debug!("已通知Worker {} 取消任务 {}", worker.hostname, task_id);
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}
