//! Process-level observability for flowrun: tracing subscriber setup.

pub mod tracing_setup;
