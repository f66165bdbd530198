//! SQLite persistence for flows and executions.

pub mod pool;
pub mod store;
