pub mod repository;
pub mod transport;

pub use repository::{
    CheckpointRepository, ConnectivityEventRepository, TaskRepository, WorkerRepository,
};
pub use transport::{DispatchRequest, ExecutionTransport, RpcHealthClient, ServingStatus};
