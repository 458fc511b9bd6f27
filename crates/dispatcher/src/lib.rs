//! Scheduling and worker health
//!
//! Task dependency tracking, worker registration and health, checkpoints and
//! the dispatch loop that ties them together. Components are constructed
//! explicitly and share the authoritative store through repository traits.

pub mod checkpoint_store;
pub mod context;
pub mod dependency_checker;
pub mod health_checker;
pub mod health_monitor;
pub mod health_state;
pub mod scheduler;
pub mod task_graph;
pub mod task_split;
pub mod transport_router;
pub mod worker_registry;

pub use checkpoint_store::CheckpointStore;
pub use context::{DispatcherContext, Repositories};
pub use dependency_checker::{find_cycle, DependencyChecker, DependencyGraph};
pub use health_checker::{HealthChecker, ProbeOutcome, ProbeStrategy};
pub use health_monitor::{HealthMonitor, HealthTransition, SweepReport, WorkerLossListener};
pub use health_state::{evaluate, HealthInputs};
pub use scheduler::{DispatchReport, FailureDisposition, Scheduler};
pub use task_graph::{Cancellation, TaskGraph};
pub use task_split::{ArraySplit, SplitStrategy, SubtaskSpec};
pub use transport_router::TransportRouter;
pub use worker_registry::WorkerRegistry;
