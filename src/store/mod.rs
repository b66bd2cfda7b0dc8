//! Persistence layer: libSQL-backed entity store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Completion, Database, Recovered, WarehouseState};
