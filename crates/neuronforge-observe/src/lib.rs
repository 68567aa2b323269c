//! Observability setup for NeuronForge binaries.

pub mod tracing_setup;
