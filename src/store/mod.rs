//! Persistence layer: the `Database` trait and its libSQL backend.

pub mod batch;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use batch::{RunBatch, WriteOp};
pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
