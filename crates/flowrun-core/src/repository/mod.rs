//! Repository trait definitions (ports).
//!
//! The infrastructure layer (flowrun-infra) implements `FlowStore` with
//! SQLite; the engine itself never depends on a storage technology.

pub mod store;

pub use store::{FlowStore, InMemoryFlowStore};
