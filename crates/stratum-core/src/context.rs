//! Process-wide device context (spec.md §3, C9).
//!
//! Holds per-rank stream handles and whether CONTEXT and DECODE execute
//! serially on one stream or concurrently on separate streams. Real compute
//! and collective streams are out of scope (that's the transformer kernel's
//! concern); these are opaque handles a real backend would bind to actual
//! CUDA/ROCm streams.

use crate::error::{Error, Result};
use crate::types::Rank;

/// Opaque per-rank compute stream handle.
#[derive(Debug, Clone, Copy)]
pub struct ComputeStream(pub Rank);

/// Opaque per-rank collective (AllReduce/AllGather) stream handle.
#[derive(Debug, Clone, Copy)]
pub struct CollectiveStream(pub Rank);

/// Process-wide device context: init at boot, destroyed at shutdown.
pub struct Context {
    tensor_para_size: usize,
    compute_streams: Vec<ComputeStream>,
    collective_streams: Vec<CollectiveStream>,
    /// When true, CONTEXT and DECODE execute concurrently on separate
    /// streams. Not yet supported (spec.md §4.2): operations that would rely
    /// on this must fail with `Error::Unimplemented`.
    concurrent: bool,
}

impl Context {
    pub fn new(tensor_para_size: usize) -> Self {
        Self {
            tensor_para_size,
            compute_streams: (0..tensor_para_size).map(|r| ComputeStream(Rank(r))).collect(),
            collective_streams: (0..tensor_para_size).map(|r| CollectiveStream(Rank(r))).collect(),
            concurrent: false,
        }
    }

    pub fn tensor_para_size(&self) -> usize {
        self.tensor_para_size
    }

    pub fn compute_stream(&self, rank: Rank) -> Result<ComputeStream> {
        self.compute_streams
            .get(rank.0)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("no such rank {rank}")))
    }

    pub fn collective_stream(&self, rank: Rank) -> Result<CollectiveStream> {
        self.collective_streams
            .get(rank.0)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("no such rank {rank}")))
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// Fails with `Unimplemented` if concurrent CONTEXT+DECODE execution is
    /// requested; this codebase only implements the serial path.
    pub fn require_serial(&self) -> Result<()> {
        if self.concurrent {
            return Err(Error::Unimplemented(
                "concurrent CONTEXT+DECODE execution".to_string(),
            ));
        }
        Ok(())
    }
}
