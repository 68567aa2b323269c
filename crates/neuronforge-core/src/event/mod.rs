//! Run event distribution.
//!
//! The engine publishes a [`WorkflowEvent`](neuronforge_types::event::WorkflowEvent)
//! for every lifecycle change of a run; UIs and loggers subscribe here.

pub mod bus;

pub use bus::{EventBus, RunEvents};
