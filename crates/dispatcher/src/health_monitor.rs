//! Periodic health sweep
//!
//! Probes every registered worker concurrently, runs the health state machine
//! on the result and notifies the scheduler when a worker is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use taskmesh_core::{
    models::{ConnectivityEventKind, Worker, WorkerHealth, WorkerStatus},
    SchedulerResult,
};

use crate::health_checker::HealthChecker;
use crate::health_state::{evaluate, HealthInputs};
use crate::worker_registry::WorkerRegistry;

/// Worker变为不健康时的回调
#[async_trait]
pub trait WorkerLossListener: Send + Sync {
    async fn on_worker_lost(&self, worker: &Worker) -> SchedulerResult<()>;
}

/// 健康状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub worker_id: Uuid,
    pub from: WorkerHealth,
    pub to: WorkerHealth,
}

/// 一轮巡检的结果
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub probed: usize,
    pub transitions: Vec<HealthTransition>,
    pub lost: Vec<Uuid>,
}

pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    checker: Arc<HealthChecker>,
    sweep_interval: Duration,
    loss_listener: Option<Arc<dyn WorkerLossListener>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        checker: Arc<HealthChecker>,
        sweep_interval: Duration,
        loss_listener: Option<Arc<dyn WorkerLossListener>>,
    ) -> Self {
        Self {
            registry,
            checker,
            sweep_interval,
            loss_listener,
        }
    }

    /// 执行一轮巡检；离线（Offline）的Worker不探测
    pub async fn sweep_once(&self) -> SchedulerResult<SweepReport> {
        let workers: Vec<Worker> = self
            .registry
            .list()
            .await?
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Offline)
            .collect();

        let outcomes = join_all(workers.iter().map(|w| self.checker.check(w))).await;

        let now = Utc::now();
        let ttl = self.registry.heartbeat_ttl();
        let mut report = SweepReport {
            probed: workers.len(),
            ..Default::default()
        };

        for (worker, outcome) in workers.iter().zip(outcomes) {
            let failures = if outcome.healthy {
                0
            } else {
                worker.consecutive_probe_failures + 1
            };
            let heartbeat_age = worker.heartbeat_age(now);
            let under_pressure = worker
                .metrics
                .as_ref()
                .map(|m| m.under_pressure(self.registry.pressure_threshold()))
                .unwrap_or(false);

            let next = evaluate(&HealthInputs {
                current: worker.health,
                probe_ok: outcome.healthy,
                heartbeat_age,
                heartbeat_ttl: ttl,
                consecutive_failures: failures,
                under_pressure,
            });

            let heartbeat_missed = heartbeat_age.map(|age| age > ttl / 2).unwrap_or(true);
            if heartbeat_missed && worker.health != WorkerHealth::Unhealthy {
                self.registry
                    .record_event(
                        worker.id,
                        ConnectivityEventKind::HeartbeatMissed,
                        json!({ "heartbeat_age_seconds": heartbeat_age.map(|a| a.num_seconds()) }),
                    )
                    .await;
            }

            if next == worker.health && failures == worker.consecutive_probe_failures {
                continue;
            }

            let updated = self.registry.apply_health(worker.id, next, failures).await?;
            if next == worker.health {
                continue;
            }
            report.transitions.push(HealthTransition {
                worker_id: worker.id,
                from: worker.health,
                to: next,
            });

            if next == WorkerHealth::Unhealthy {
                warn!(
                    "Worker {} ({}) 判定为不健康: {}",
                    worker.hostname,
                    worker.id,
                    outcome.error.as_deref().unwrap_or("心跳超时")
                );
                self.registry
                    .record_event(
                        worker.id,
                        ConnectivityEventKind::Disconnected,
                        json!({
                            "probe": outcome.strategy.as_str(),
                            "consecutive_failures": failures,
                            "error": outcome.error,
                        }),
                    )
                    .await;
                report.lost.push(worker.id);

                if let Some(listener) = &self.loss_listener {
                    if let Err(e) = listener.on_worker_lost(&updated).await {
                        error!("处理Worker {} 失联时出错: {}", worker.id, e);
                    }
                }
            }
        }

        self.registry.stats().await?;
        if !report.transitions.is_empty() {
            info!(
                "健康巡检完成: 探测 {} 个Worker, {} 个状态变化, {} 个失联",
                report.probed,
                report.transitions.len(),
                report.lost.len()
            );
        } else {
            debug!("健康巡检完成: 探测 {} 个Worker", report.probed);
        }
        Ok(report)
    }

    /// 周期巡检，收到关闭信号后退出
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("启动健康巡检，间隔 {:?}", self.sweep_interval);
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("健康巡检失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止健康巡检");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use taskmesh_core::config::HealthConfig;
    use taskmesh_core::models::ProbeProtocol;
    use taskmesh_infrastructure::{MetricsCollector, TimeoutConfig, TimeoutHandler};
    use taskmesh_testing_utils::{spawn_tcp_listener, unused_address, MockStore, WorkerBuilder};

    #[derive(Default)]
    struct RecordingListener {
        lost: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl WorkerLossListener for RecordingListener {
        async fn on_worker_lost(&self, worker: &Worker) -> SchedulerResult<()> {
            self.lost.lock().unwrap().push(worker.id);
            Ok(())
        }
    }

    fn monitor(store: &MockStore, listener: Arc<RecordingListener>) -> HealthMonitor {
        let config = HealthConfig {
            heartbeat_ttl_seconds: 60,
            ..Default::default()
        };
        let metrics = Arc::new(MetricsCollector::new());
        let registry = Arc::new(WorkerRegistry::new(
            store.worker_repository(),
            store.connectivity_repository(),
            &config,
            metrics.clone(),
        ));
        let timeout = TimeoutHandler::new(TimeoutConfig {
            probe_timeout: Duration::from_secs(1),
            checkpoint_write_timeout: Duration::from_secs(1),
        });
        let checker = Arc::new(HealthChecker::new(&config, timeout, None, metrics));
        HealthMonitor::new(registry, checker, Duration::from_millis(20), Some(listener))
    }

    #[tokio::test]
    async fn test_unknown_worker_becomes_healthy() {
        let store = MockStore::new();
        let addr = spawn_tcp_listener().await;
        let worker = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Tcp)
            .with_address(addr.to_string())
            .with_health(WorkerHealth::Unknown)
            .build();
        store.put_worker(worker.clone());

        let report = monitor(&store, Arc::default()).sweep_once().await.unwrap();
        assert_eq!(report.probed, 1);
        assert_eq!(store.worker(worker.id).unwrap().health, WorkerHealth::Healthy);
    }

    #[tokio::test]
    async fn test_failing_probes_degrade_then_lose_worker() {
        let store = MockStore::new();
        let listener = Arc::new(RecordingListener::default());
        let monitor = monitor(&store, listener.clone());
        let worker = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Tcp)
            .with_address(unused_address().to_string())
            .build();
        store.put_worker(worker.clone());

        monitor.sweep_once().await.unwrap();
        let after_first = store.worker(worker.id).unwrap();
        assert_eq!(after_first.health, WorkerHealth::Degraded);
        assert_eq!(after_first.consecutive_probe_failures, 1);
        assert!(listener.lost.lock().unwrap().is_empty());

        let report = monitor.sweep_once().await.unwrap();
        assert_eq!(report.lost, vec![worker.id]);
        assert_eq!(store.worker(worker.id).unwrap().health, WorkerHealth::Unhealthy);
        assert_eq!(*listener.lost.lock().unwrap(), vec![worker.id]);

        // 记录保留，只是不再可分配
        assert!(store.worker(worker.id).is_some());
    }

    #[tokio::test]
    async fn test_offline_workers_are_skipped() {
        let store = MockStore::new();
        let worker = WorkerBuilder::new()
            .with_protocol(ProbeProtocol::Tcp)
            .with_address(unused_address().to_string())
            .with_status(WorkerStatus::Offline)
            .build();
        store.put_worker(worker.clone());

        let report = monitor(&store, Arc::default()).sweep_once().await.unwrap();
        assert_eq!(report.probed, 0);
        assert_eq!(store.worker(worker.id).unwrap().health, WorkerHealth::Healthy);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = MockStore::new();
        let monitor = Arc::new(monitor(&store, Arc::default()));
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
