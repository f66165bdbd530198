//! Workflow execution engine and repository trait definitions for flowrun.
//!
//! This crate defines the "ports" (the `FlowStore` and `AgentInvoker`
//! traits) that the infrastructure layer implements. It depends only on
//! `flowrun-types` -- never on `flowrun-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
