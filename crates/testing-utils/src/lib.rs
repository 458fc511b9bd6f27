//! # TaskMesh Testing Utils
//!
//! Shared test doubles for the workspace: an in-memory store implementing every
//! repository trait with the same atomic semantics as the SQLite store, test data
//! builders, scripted execution and RPC health transports, and small network
//! helpers for probe tests.
//!
//! ```toml
//! [dev-dependencies]
//! taskmesh-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
