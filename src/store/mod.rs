//! Persistence layer: libSQL-backed storage for invites, profiles, and
//! client context slots.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
