//! Per-step tensor assembly and the forward-pass seam (spec.md §4.4, C7).

pub mod driver;

pub use driver::{ForwardRunner, SimulatedForwardRunner, StepBatch, StepBatchBuilder, StepDriver};
