//! Per-request state and the inbound request DTO (spec.md §3, §6).

use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::types::{BlockId, RequestId};

/// Decoding controls attached to a request at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub max_new_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_token_ids: Vec<i32>,
}

fn default_temperature() -> f32 {
    1.0
}

/// The client-facing request body, carried across the `Enqueue` boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub req_id: RequestId,
    pub model_name: String,
    pub input_tokens: Vec<i32>,
    pub sampling_config: SamplingConfig,
}

/// Which half of generation a request is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferStage {
    /// Prompt prefill: every prompt token is processed in one step.
    Context,
    /// Per-token decode: one new token processed per step.
    Decode,
}

/// Why a request left the `running` lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// `output_tokens.size()` reached `input_tokens.size() + max_new_tokens`.
    Length,
    /// Sampler produced a stop token id.
    Eos,
    /// Rejected or starved by the admission gate / scheduler.
    Capacity,
    /// A device or step error terminated the request.
    Error,
    /// Still in flight.
    None,
}

/// The outcome delivered to a request's notifier once `finished` is observed.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub req_id: RequestId,
    pub finish_reason: FinishReason,
    pub output_tokens: Vec<i32>,
    pub error: Option<String>,
}

/// Full per-request bookkeeping the scheduler and step driver operate on.
///
/// Lifecycle: created in `Enqueue` → `waiting_buffer` → `waiting` → `running`
/// ⇌ `swapped` → `finished` (terminal).
#[derive(Debug)]
pub struct InferRequest {
    pub req_id: RequestId,
    pub model_name: String,
    pub sampling_config: SamplingConfig,

    pub input_tokens: Vec<i32>,
    pub output_tokens: Vec<i32>,

    pub infer_stage: InferStage,
    /// Count of DECODE iterations executed so far.
    pub step: usize,

    /// One block-id list per tensor-parallel rank; parallel shape across ranks.
    /// Holds device block ids while the request is `running`.
    pub kv_cache_blocks: Vec<Vec<BlockId>>,
    /// Mirror of `kv_cache_blocks` used while the request is `swapped`; holds
    /// host block ids. Exactly one of the two is non-empty at a time.
    pub host_blocks: Vec<Vec<BlockId>>,
    /// Copied from the block manager's config at enqueue time.
    pub block_size: usize,

    pub finished: bool,
    pub finish_reason: FinishReason,
    pub finish_error: Option<String>,

    pub logits_offset: usize,

    notifier: Option<mpsc::Sender<RequestOutcome>>,
}

impl InferRequest {
    pub fn new(
        req: Request,
        num_ranks: usize,
        block_size: usize,
        notifier: mpsc::Sender<RequestOutcome>,
    ) -> Self {
        let output_tokens = req.input_tokens.clone();
        Self {
            req_id: req.req_id,
            model_name: req.model_name,
            sampling_config: req.sampling_config,
            input_tokens: req.input_tokens,
            output_tokens,
            infer_stage: InferStage::Context,
            step: 0,
            kv_cache_blocks: vec![Vec::new(); num_ranks],
            host_blocks: vec![Vec::new(); num_ranks],
            block_size,
            finished: false,
            finish_reason: FinishReason::None,
            finish_error: None,
            logits_offset: 0,
            notifier: Some(notifier),
        }
    }

    /// Number of additional generated tokens appended past the prompt.
    pub fn generated_len(&self) -> usize {
        self.output_tokens.len() - self.input_tokens.len()
    }

    pub fn blocks_held(&self, rank: usize) -> usize {
        self.kv_cache_blocks[rank].len()
    }

    /// Mark the request finished and notify its waiter exactly once. Calling
    /// this more than once is a no-op (the notifier is consumed on first use).
    pub fn finish(&mut self, reason: FinishReason, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.finish_reason = reason;
        self.finish_error = error.clone();
        if let Some(tx) = self.notifier.take() {
            let _ = tx.send(RequestOutcome {
                req_id: self.req_id,
                finish_reason: reason,
                output_tokens: self.output_tokens.clone(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampling(max_new_tokens: usize) -> SamplingConfig {
        SamplingConfig {
            max_new_tokens,
            temperature: 1.0,
            top_k: None,
            top_p: None,
            stop_token_ids: vec![],
        }
    }

    #[test]
    fn new_request_starts_in_context_with_equal_token_lens() {
        let (tx, _rx) = mpsc::channel();
        let req = Request {
            req_id: RequestId(1),
            model_name: "m".into(),
            input_tokens: vec![1, 2, 3, 4],
            sampling_config: sampling(2),
        };
        let infer = InferRequest::new(req, 2, 1024, tx);
        assert_eq!(infer.infer_stage, InferStage::Context);
        assert_eq!(infer.output_tokens, infer.input_tokens);
        assert_eq!(infer.generated_len(), 0);
        assert_eq!(infer.kv_cache_blocks.len(), 2);
    }

    #[test]
    fn finish_notifies_exactly_once() {
        let (tx, rx) = mpsc::channel();
        let req = Request {
            req_id: RequestId(7),
            model_name: "m".into(),
            input_tokens: vec![1],
            sampling_config: sampling(1),
        };
        let mut infer = InferRequest::new(req, 1, 1024, tx);
        infer.finish(FinishReason::Length, None);
        infer.finish(FinishReason::Eos, None);
        let outcome = rx.try_recv().expect("one outcome");
        assert_eq!(outcome.finish_reason, FinishReason::Length);
        assert!(rx.try_recv().is_err());
    }
}
