//! Shared domain types for flowrun.
//!
//! Flow definitions and their step tree, execution records, engine events,
//! engine configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod flow;
