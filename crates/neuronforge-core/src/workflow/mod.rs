//! Workflow compilation and execution.
//!
//! - `definition` -- YAML/JSON workflow files
//! - `dag` -- dependency graph, cycle detection, batches, critical path
//! - `reference` -- `{{step.path}}` parsing and resolution
//! - `data_ops` -- filter, sort, group, aggregate, join and friends
//! - `expression` -- JEXL conditions
//! - `capability` -- plugin, AI, and persistence-hook ports
//! - `step_runner` -- per-kind step execution
//! - `retry` -- recovery policies and backoff
//! - `parallel` -- bounded concurrent batch execution
//! - `controller` -- run state, checkpoints, rollback, pause/stop
//! - `executor` -- the engine tying it together

pub mod capability;
pub mod controller;
pub mod dag;
pub mod data_ops;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod parallel;
pub mod reference;
pub mod retry;
pub mod step_runner;
