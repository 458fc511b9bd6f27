pub mod checkpoint;
pub mod connectivity;
pub mod snapshot;
pub mod task;
pub mod worker;

pub use checkpoint::{Checkpoint, NewCheckpoint};
pub use connectivity::{ConnectivityEvent, ConnectivityEventKind};
pub use snapshot::{RetryStats, SchedulerSnapshot, WorkerLoad};
pub use task::{dispatch_order, Criticality, Task, TaskStatus};
pub use worker::{
    ProbeProtocol, Resources, TransportConfig, Worker, WorkerHealth, WorkerMetrics,
    WorkerRegistration, WorkerStats, WorkerStatus,
};
