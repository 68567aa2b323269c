//! Shared domain types for the NeuronForge workflow engine.
//!
//! Everything that crosses a crate boundary lives here: step definitions,
//! per-step results, execution state and checkpoints, the DAG validation
//! report, the error taxonomy, engine configuration, and run events.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod step;
pub mod validation;
