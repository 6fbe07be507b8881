//! Persistence layer — accounts, forwarding rules, and message logs.

pub mod libsql_backend;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{NewAccount, NewRule, Store};
