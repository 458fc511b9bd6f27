//! Active liveness probes
//!
//! The probe strategy is picked from the worker's declared protocol through an
//! explicit table; each strategy is a plain async function. Every probe is
//! bounded by the probe timeout so one unresponsive worker cannot stall a sweep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use taskmesh_core::{
    config::HealthConfig,
    models::{ProbeProtocol, Worker},
    traits::{RpcHealthClient, ServingStatus},
    SchedulerError, SchedulerResult,
};
use taskmesh_infrastructure::{HttpExecutionTransport, MetricsCollector, TimeoutHandler};

/// 探测策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    HttpGet { secure: bool },
    Rpc,
    TcpConnect,
    HeartbeatOnly,
}

impl ProbeStrategy {
    /// 协议到探测策略的映射
    pub fn for_protocol(protocol: ProbeProtocol) -> Self {
        match protocol {
            ProbeProtocol::Http => ProbeStrategy::HttpGet { secure: false },
            ProbeProtocol::Https => ProbeStrategy::HttpGet { secure: true },
            ProbeProtocol::Rpc => ProbeStrategy::Rpc,
            ProbeProtocol::Tcp => ProbeStrategy::TcpConnect,
            ProbeProtocol::Unknown => ProbeStrategy::HeartbeatOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStrategy::HttpGet { secure: false } => "http",
            ProbeStrategy::HttpGet { secure: true } => "https",
            ProbeStrategy::Rpc => "rpc",
            ProbeStrategy::TcpConnect => "tcp",
            ProbeStrategy::HeartbeatOnly => "heartbeat",
        }
    }
}

/// 单次探测结果
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub strategy: ProbeStrategy,
    pub healthy: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

pub struct HealthChecker {
    http_client: reqwest::Client,
    rpc_client: Option<Arc<dyn RpcHealthClient>>,
    timeout: TimeoutHandler,
    default_endpoint: String,
    heartbeat_ttl: chrono::Duration,
    metrics: Arc<MetricsCollector>,
}

impl HealthChecker {
    pub fn new(
        config: &HealthConfig,
        timeout: TimeoutHandler,
        rpc_client: Option<Arc<dyn RpcHealthClient>>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            rpc_client,
            timeout,
            default_endpoint: config.default_health_endpoint.clone(),
            heartbeat_ttl: chrono::Duration::seconds(config.heartbeat_ttl_seconds as i64),
            metrics,
        }
    }

    /// 对Worker执行一次探测
    #[instrument(skip(self, worker), fields(worker_id = %worker.id, address = %worker.transport.address))]
    pub async fn check(&self, worker: &Worker) -> ProbeOutcome {
        let mut strategy = ProbeStrategy::for_protocol(worker.transport.protocol);
        if strategy == ProbeStrategy::Rpc && self.rpc_client.is_none() {
            debug!("未配置RPC健康检查客户端，使用心跳判断");
            strategy = ProbeStrategy::HeartbeatOnly;
        }

        let started = Instant::now();
        let result = match strategy {
            ProbeStrategy::HeartbeatOnly => Ok(self.heartbeat_recent(worker, Utc::now())),
            _ => {
                self.timeout
                    .probe(self.run_probe(strategy, worker), &worker.transport.address)
                    .await
            }
        };
        let duration = started.elapsed();

        let outcome = match result {
            Ok(healthy) => ProbeOutcome {
                strategy,
                healthy,
                error: (!healthy).then(|| "探测返回不健康".to_string()),
                duration,
            },
            Err(e) => ProbeOutcome {
                strategy,
                healthy: false,
                error: Some(e.to_string()),
                duration,
            },
        };

        self.metrics
            .record_probe(strategy.as_str(), outcome.healthy, duration.as_secs_f64());
        debug!(
            "探测完成: strategy={} healthy={} 耗时 {:?}",
            strategy.as_str(),
            outcome.healthy,
            duration
        );
        outcome
    }

    async fn run_probe(&self, strategy: ProbeStrategy, worker: &Worker) -> SchedulerResult<bool> {
        match strategy {
            ProbeStrategy::HttpGet { secure } => self.probe_http(worker, secure).await,
            ProbeStrategy::Rpc => self.probe_rpc(worker).await,
            ProbeStrategy::TcpConnect => probe_tcp(&worker.transport.address).await,
            ProbeStrategy::HeartbeatOnly => Ok(self.heartbeat_recent(worker, Utc::now())),
        }
    }

    async fn probe_http(&self, worker: &Worker, secure: bool) -> SchedulerResult<bool> {
        let scheme = if secure { "https" } else { "http" };
        let endpoint = worker
            .transport
            .health_endpoint
            .as_deref()
            .unwrap_or(&self.default_endpoint);
        let url = format!("{scheme}://{}{endpoint}", worker.transport.address);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(HttpExecutionTransport::map_request_error)?;
        Ok(response.status() == StatusCode::OK)
    }

    async fn probe_rpc(&self, worker: &Worker) -> SchedulerResult<bool> {
        let client = self
            .rpc_client
            .as_ref()
            .ok_or_else(|| SchedulerError::Configuration("未配置RPC健康检查客户端".to_string()))?;
        let status = client.check(&worker.transport.address).await?;
        Ok(status == ServingStatus::Serving)
    }

    /// 心跳在TTL内视为健康
    pub fn heartbeat_recent(&self, worker: &Worker, now: DateTime<Utc>) -> bool {
        worker
            .heartbeat_age(now)
            .map(|age| age < self.heartbeat_ttl)
            .unwrap_or(false)
    }
}

async fn probe_tcp(address: &str) -> SchedulerResult<bool> {
    let stream = TcpStream::connect(address).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::ConnectionRefused => SchedulerError::ConnectionRefused(address.to_string()),
        std::io::ErrorKind::ConnectionReset => SchedulerError::ConnectionReset(address.to_string()),
        _ => SchedulerError::Network(format!("{address}: {e}")),
    })?;
    drop(stream);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_infrastructure::TimeoutConfig;
    use taskmesh_testing_utils::{
        spawn_http_responder, spawn_silent_listener, spawn_tcp_listener, unused_address,
        MockRpcHealthClient, WorkerBuilder,
    };

    fn checker(rpc: Option<Arc<dyn RpcHealthClient>>) -> HealthChecker {
        checker_with_timeout(rpc, Duration::from_secs(2))
    }

    fn checker_with_timeout(
        rpc: Option<Arc<dyn RpcHealthClient>>,
        probe_timeout: Duration,
    ) -> HealthChecker {
        let timeout = TimeoutHandler::new(TimeoutConfig {
            probe_timeout,
            checkpoint_write_timeout: Duration::from_secs(2),
        });
        HealthChecker::new(
            &HealthConfig::default(),
            timeout,
            rpc,
            Arc::new(MetricsCollector::new()),
        )
    }

    #[test]
    fn test_strategy_table() {
        assert_eq!(
            ProbeStrategy::for_protocol(ProbeProtocol::Https),
            ProbeStrategy::HttpGet { secure: true }
        );
        assert_eq!(
            ProbeStrategy::for_protocol(ProbeProtocol::Unknown),
            ProbeStrategy::HeartbeatOnly
        );
    }

    #[tokio::test]
    async fn test_http_probe_requires_200() {
        let ok = spawn_http_responder(200, "{}").await;
        let unavailable = spawn_http_responder(503, "").await;
        let checker = checker(None);

        let healthy = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Http)
            .with_address(ok.to_string())
            .build();
        assert!(checker.check(&healthy).await.healthy);

        let failing = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Http)
            .with_address(unavailable.to_string())
            .build();
        let outcome = checker.check(&failing).await;
        assert!(!outcome.healthy);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_silent_http_worker_is_unhealthy_within_timeout() {
        let silent = spawn_silent_listener().await;
        let checker = checker_with_timeout(None, Duration::from_secs(1));
        let worker = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Http)
            .with_address(silent.to_string())
            .build();

        let started = Instant::now();
        let outcome = checker.check(&worker).await;
        assert!(!outcome.healthy);
        assert!(outcome.error.is_some());
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(outcome.duration >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let open = spawn_tcp_listener().await;
        let checker = checker(None);

        let up = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Tcp)
            .with_address(open.to_string())
            .build();
        assert!(checker.check(&up).await.healthy);

        let down = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Tcp)
            .with_address(unused_address().to_string())
            .build();
        assert!(!checker.check(&down).await.healthy);
    }

    #[tokio::test]
    async fn test_rpc_probe_uses_serving_status() {
        let rpc = Arc::new(MockRpcHealthClient::new());
        rpc.set_status("10.0.0.1:50051", ServingStatus::Serving);
        rpc.set_status("10.0.0.2:50051", ServingStatus::NotServing);
        let checker = checker(Some(rpc.clone()));

        let serving = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Rpc)
            .with_address("10.0.0.1:50051")
            .build();
        let not_serving = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Rpc)
            .with_address("10.0.0.2:50051")
            .build();

        assert!(checker.check(&serving).await.healthy);
        assert!(!checker.check(&not_serving).await.healthy);
        assert_eq!(rpc.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_protocol_uses_heartbeat() {
        let checker = checker(None);
        let recent = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Unknown)
            .build();
        let outcome = checker.check(&recent).await;
        assert_eq!(outcome.strategy, ProbeStrategy::HeartbeatOnly);
        assert!(outcome.healthy);

        let silent = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Unknown)
            .with_last_heartbeat(Some(Utc::now() - chrono::Duration::seconds(600)))
            .build();
        assert!(!checker.check(&silent).await.healthy);
    }
}
