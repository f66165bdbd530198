//! Agent invoker implementations.

pub mod simulated;

pub use simulated::SimulatedAgentInvoker;
