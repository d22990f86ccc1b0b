//! Error taxonomy for the batching and KV-cache core.
//!
//! Variants map 1:1 to the error kinds in spec.md §7; see each variant's
//! doc comment for its recovery semantics.

use thiserror::Error;

use crate::types::Rank;

#[derive(Error, Debug)]
pub enum Error {
    /// Enqueue rejected: waiting queue is at `max_waiting_queue_len`. Client may retry later.
    #[error("waiting queue at capacity ({len}/{limit})")]
    ExceedCapacity { len: usize, limit: usize },

    /// Enqueue rejected: prompt longer than `max_token_len`. Fatal for that request.
    #[error("prompt length {len} exceeds max_token_len {limit}")]
    ExceedLength { len: usize, limit: usize },

    /// Block allocator could not satisfy an allocation. Recovered by the
    /// scheduler triggering swap-out and retrying within the same step.
    #[error("out of device memory: requested {requested} blocks, {free} free")]
    OutOfDeviceMemory { requested: usize, free: usize },

    /// Host memory sizing failed at startup. Fatal.
    #[error("insufficient host memory: need {needed} bytes, {available} available")]
    InsufficientHostMemory { needed: u64, available: u64 },

    /// Unknown block id or malformed shape. Indicates a programmer error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Concurrent CONTEXT+DECODE execution path, not yet supported.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Kernel or collective failure; the entire batch is marked finished with this error.
    #[error("device error on rank {rank}: {message}")]
    DeviceError { rank: Rank, message: String },

    /// Normal completion: sampling produced EOS, hit `max_new_tokens`, or `Stop()` was called.
    #[error("stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
