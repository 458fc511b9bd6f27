pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;
pub use logging::{LogConfig, LogFormat};
pub use retry::{RetryConfig, RetryOutcome, RetryPolicy};
