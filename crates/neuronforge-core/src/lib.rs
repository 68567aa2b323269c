//! Core of the NeuronForge workflow engine.
//!
//! Validation, reference resolution, data operations, and execution live
//! here. The crate performs no I/O of its own: plugins, the AI capability,
//! and persistence hooks are ports (traits) implemented by `neuronforge-infra`.

pub mod event;
pub mod workflow;
