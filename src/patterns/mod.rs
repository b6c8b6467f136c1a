//! Reusable orchestration shapes built on [`OrchestrationContext`](crate::OrchestrationContext).
//!
//! Each helper is plain orchestration code: it only talks to the context, so
//! it replays like anything else written against it.
//!
//! - [`chaining`]: run activities in sequence, compensate once on failure.
//! - [`fan_out`]: run one activity per input in parallel and aggregate.
//! - [`approval`]: notify someone and wait for an answer with a durable deadline.
//! - [`eternal`]: one generation of a never-ending loop.
//!
//! [`video`] wires all four into the video processing sample.

pub mod approval;
pub mod chaining;
pub mod eternal;
pub mod fan_out;
pub mod video;

pub use approval::{request_interaction, Interaction};
pub use chaining::{compensate, run_chain, ChainFailure, ChainStep, StepInput};
pub use eternal::run_generation;
pub use fan_out::{fan_out_fan_in, select_best};
