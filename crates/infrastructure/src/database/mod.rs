pub(crate) mod mapping;
pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteStore;
