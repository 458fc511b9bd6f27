pub mod database;
pub mod observability;
pub mod timeout_handler;
pub mod transport;

pub use database::{migrations::run_migrations, SqliteStore};
pub use observability::MetricsCollector;
pub use timeout_handler::{TimeoutConfig, TimeoutHandler};
pub use transport::HttpExecutionTransport;
