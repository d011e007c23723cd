//! Persistence layer — libSQL-backed message log and admission queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::MessageLog;
