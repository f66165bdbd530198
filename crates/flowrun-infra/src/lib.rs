//! Infrastructure layer for flowrun.
//!
//! Contains implementations of the ports defined in `flowrun-core`: the
//! SQLite flow store, the simulated agent invoker, engine config loading
//! and flow file discovery.

pub mod agent;
pub mod config;
pub mod flow_files;
pub mod sqlite;
