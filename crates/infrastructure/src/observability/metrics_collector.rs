//! Metrics collector for the scheduling subsystem
//!
//! Handles are registered once and cloned cheaply; labelled series are created
//! on demand through the macros.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use taskmesh_core::models::{WorkerHealth, WorkerStats};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MetricsCollector {
    // 任务指标
    tasks_submitted_total: Counter,
    tasks_assigned_total: Counter,
    tasks_reassigned_total: Counter,
    tasks_cancelled_total: Counter,
    task_execution_duration: Histogram,

    // Worker指标
    registered_workers: Gauge,
    active_workers: Gauge,
    healthy_workers: Gauge,
    available_slots: Gauge,

    // 调度器指标
    ready_queue_depth: Gauge,
    dispatch_cycle_duration: Histogram,
    scheduler_degraded: Gauge,

    // 检查点指标
    checkpoint_saves_total: Counter,
    checkpoint_failures_total: Counter,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("taskmesh_tasks_submitted_total"),
            tasks_assigned_total: counter!("taskmesh_tasks_assigned_total"),
            tasks_reassigned_total: counter!("taskmesh_tasks_reassigned_total"),
            tasks_cancelled_total: counter!("taskmesh_tasks_cancelled_total"),
            task_execution_duration: histogram!("taskmesh_task_execution_duration_seconds"),
            registered_workers: gauge!("taskmesh_workers_registered"),
            active_workers: gauge!("taskmesh_workers_active"),
            healthy_workers: gauge!("taskmesh_workers_healthy"),
            available_slots: gauge!("taskmesh_worker_available_slots"),
            ready_queue_depth: gauge!("taskmesh_ready_queue_depth"),
            dispatch_cycle_duration: histogram!("taskmesh_dispatch_cycle_duration_seconds"),
            scheduler_degraded: gauge!("taskmesh_scheduler_degraded"),
            checkpoint_saves_total: counter!("taskmesh_checkpoint_saves_total"),
            checkpoint_failures_total: counter!("taskmesh_checkpoint_failures_total"),
        }
    }

    pub fn record_task_submitted(&self, count: u64) {
        self.tasks_submitted_total.increment(count);
    }

    pub fn record_task_assigned(&self, task_type: &str, worker: &str) {
        self.tasks_assigned_total.increment(1);
        debug!(task_type, worker, "任务已分配");
    }

    pub fn record_task_completed(&self, task_type: &str, duration_seconds: f64) {
        counter!("taskmesh_tasks_completed_total", "task_type" => task_type.to_string())
            .increment(1);
        self.task_execution_duration.record(duration_seconds);
    }

    pub fn record_task_failed(&self, task_type: &str, category: &str) {
        counter!(
            "taskmesh_tasks_failed_total",
            "task_type" => task_type.to_string(),
            "category" => category.to_string()
        )
        .increment(1);
        warn!(task_type, category, "任务最终失败");
    }

    pub fn record_task_retry(&self, task_type: &str, retry_count: i32) {
        counter!("taskmesh_tasks_retried_total", "task_type" => task_type.to_string())
            .increment(1);
        info!(task_type, retry_count, "任务进入重试");
    }

    pub fn record_task_reassigned(&self, from_checkpoint: bool) {
        self.tasks_reassigned_total.increment(1);
        debug!(from_checkpoint, "Worker失联，任务重新排队");
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled_total.increment(1);
    }

    pub fn record_probe(&self, protocol: &str, healthy: bool, duration_seconds: f64) {
        let outcome = if healthy { "success" } else { "failure" };
        counter!(
            "taskmesh_health_probes_total",
            "protocol" => protocol.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("taskmesh_health_probe_duration_seconds", "protocol" => protocol.to_string())
            .record(duration_seconds);
    }

    pub fn record_health_transition(&self, from: WorkerHealth, to: WorkerHealth) {
        counter!(
            "taskmesh_health_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    pub fn update_worker_stats(&self, stats: &WorkerStats) {
        self.registered_workers.set(stats.total as f64);
        self.active_workers.set(stats.active as f64);
        self.healthy_workers.set(stats.healthy as f64);
        self.available_slots.set(stats.available_slots as f64);
    }

    pub fn update_ready_queue_depth(&self, depth: usize) {
        self.ready_queue_depth.set(depth as f64);
    }

    pub fn record_dispatch_cycle(&self, duration_seconds: f64) {
        self.dispatch_cycle_duration.record(duration_seconds);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.scheduler_degraded.set(if degraded { 1.0 } else { 0.0 });
    }

    pub fn record_checkpoint_saved(&self) {
        self.checkpoint_saves_total.increment(1);
    }

    pub fn record_checkpoint_failure(&self) {
        self.checkpoint_failures_total.increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_task_submitted(3);
        collector.record_probe("http", false, 0.2);
        collector.record_health_transition(WorkerHealth::Healthy, WorkerHealth::Degraded);
        collector.update_worker_stats(&WorkerStats::default());
        collector.set_degraded(true);
    }
}
