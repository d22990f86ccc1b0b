//! Stratum Core - distributed LLM inference batching and KV-cache engine.
//!
//! This crate implements the request admission, batching, and paged
//! KV-cache lifecycle subsystem that drives a transformer generation loop
//! across multiple accelerator devices:
//!
//! - A batch scheduler that admits, grows, preempts, and resumes requests
//!   every generation step.
//! - A paged KV-cache block manager mapping requests onto fixed-size blocks
//!   of device and host memory, with swap-out/in/drop.
//! - A step driver that assembles per-request block pointer tables and
//!   token indices into flat tensors and invokes the forward pass.
//!
//! Transformer kernels, weight loading, tokenization, and sampling are
//! external collaborators; see [`step::ForwardRunner`] for the seam.

pub mod batch;
pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod request;
pub mod step;
pub mod types;

pub use batch::{BatchScheduler, BatchState, ContinuousBatchingStrategy, ScheduleStrategy};
pub use block::{AllocatorConfig, Block, BlockAllocator, BlockManager, BlockManagerStats, DeviceBackend};
pub use config::EngineConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use manager::BatchManager;
pub use request::{FinishReason, InferRequest, InferStage, Request, RequestOutcome, SamplingConfig};
pub use step::{ForwardRunner, StepBatch, StepDriver};
pub use types::{BlockId, Rank, RequestId};
