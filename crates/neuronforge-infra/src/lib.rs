//! Infrastructure layer for NeuronForge.
//!
//! Implementations of the capability ports defined in `neuronforge-core`:
//! the plugin registry with its built-in plugins, tracing-backed execution
//! hooks, a file-backed state store, and the engine config loader.

pub mod ai;
pub mod config;
pub mod hooks;
pub mod plugin;
pub mod state_store;
