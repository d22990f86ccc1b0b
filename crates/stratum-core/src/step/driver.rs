//! Marshals a scheduled batch into flat device tables and invokes the
//! forward pass (spec.md §4.4, C7).

use std::collections::VecDeque;

use crate::block::manager::BlockManager;
use crate::error::Result;
use crate::request::{InferRequest, InferStage};
use crate::types::Rank;

/// Flat per-step tensors handed to the transformer forward pass. Field
/// layout mirrors the offset/pointer tables a real kernel expects; building
/// the actual device tensors from these vectors is the forward pass's job.
#[derive(Debug, Clone)]
pub struct StepBatch {
    pub input_ids: Vec<i32>,
    pub input_offset_i32: Vec<i32>,
    pub input_offset_u64: Vec<u64>,
    pub rotary_embedding_pos: Vec<i64>,
    /// Shape `[num_layer, total_block_num * 2]`, flattened row-major: for
    /// layer `L`, the first `total_block_num` entries are K-block pointers,
    /// the next `total_block_num` are V-block pointers.
    pub kv_list: Vec<usize>,
    /// Prefix sum of per-request block counts, leading 0, length `batch+1`.
    pub kv_cache_offset_list: Vec<usize>,
    pub total_seq_len: usize,
    pub total_block_num: usize,
    pub batch_size: usize,
}

/// Builds a `StepBatch` for one rank from the scheduler's running queue.
pub struct StepBatchBuilder<'a> {
    running: &'a VecDeque<InferRequest>,
    rank: Rank,
    block_manager: &'a BlockManager,
    num_layer: usize,
}

impl<'a> StepBatchBuilder<'a> {
    pub fn new(
        running: &'a VecDeque<InferRequest>,
        rank: Rank,
        block_manager: &'a BlockManager,
        num_layer: usize,
    ) -> Self {
        Self {
            running,
            rank,
            block_manager,
            num_layer,
        }
    }

    pub fn build(&self) -> Result<StepBatch> {
        let mut input_ids = Vec::new();
        let mut input_offset_i32 = vec![0i32];
        let mut input_offset_u64 = vec![0u64];
        let mut rotary_embedding_pos = Vec::new();
        let mut kv_cache_offset_list = vec![0usize];
        let mut block_ptrs: Vec<Vec<usize>> = Vec::new();

        let mut total_seq_len = 0usize;
        let mut total_block_num = 0usize;

        let allocator = self.block_manager.device(self.rank)?;

        for req in self.running {
            match req.infer_stage {
                InferStage::Context => {
                    input_ids.extend(req.input_tokens.iter().copied());
                    rotary_embedding_pos.extend(0..req.input_tokens.len() as i64);
                    total_seq_len += req.input_tokens.len();
                }
                InferStage::Decode => {
                    let last = *req.output_tokens.last().expect("at least the prompt's last token");
                    input_ids.push(last);
                    rotary_embedding_pos.push(req.output_tokens.len() as i64 - 1);
                    total_seq_len += 1;
                }
            }
            input_offset_i32.push(input_ids.len() as i32);
            input_offset_u64.push(input_ids.len() as u64);

            let block_ids = &req.kv_cache_blocks[self.rank.0];
            total_block_num += block_ids.len();
            kv_cache_offset_list.push(total_block_num);
            block_ptrs.push(allocator.get_block_ptrs(block_ids)?);
        }

        let block_size = allocator.config().block_size;
        let per_layer_bytes = block_size / self.num_layer.max(1);
        let half = per_layer_bytes / 2;

        let mut kv_list = Vec::with_capacity(self.num_layer * total_block_num * 2);
        for layer in 0..self.num_layer {
            let layer_offset = layer * per_layer_bytes;
            for ptrs in &block_ptrs {
                for &p in ptrs {
                    kv_list.push(p + layer_offset);
                }
            }
            for ptrs in &block_ptrs {
                for &p in ptrs {
                    kv_list.push(p + layer_offset + half);
                }
            }
        }

        Ok(StepBatch {
            input_ids,
            input_offset_i32,
            input_offset_u64,
            rotary_embedding_pos,
            kv_list,
            kv_cache_offset_list,
            total_seq_len,
            total_block_num,
            batch_size: self.running.len(),
        })
    }
}

/// Collaborator that runs the transformer forward pass and returns one
/// sampled token id per request, in running-queue order. Real kernels
/// (matmul, attention, layernorm) are out of scope; this is the seam they
/// plug into.
pub trait ForwardRunner: Send + Sync {
    fn forward(&self, batch: &StepBatch, rank: Rank) -> Result<Vec<i32>>;
}

/// Deterministic stand-in used by the driver's own tests and by callers who
/// haven't wired a real kernel yet: always samples the next token as
/// `(step index within the batch) as i32`, which is enough to exercise the
/// scheduling and block-growth paths end to end.
pub struct SimulatedForwardRunner;

impl ForwardRunner for SimulatedForwardRunner {
    fn forward(&self, batch: &StepBatch, _rank: Rank) -> Result<Vec<i32>> {
        Ok((0..batch.batch_size).map(|i| i as i32).collect())
    }
}

/// Assembles the batch on every rank and invokes the forward pass. Real
/// deployments pin one worker thread per rank; the forward kernels
/// themselves are out of scope here, so this drives them sequentially.
pub struct StepDriver {
    num_layer: usize,
}

impl StepDriver {
    pub fn new(num_layer: usize) -> Self {
        Self { num_layer }
    }

    /// Runs one step against `running`, appending each request's sampled
    /// token to `output_tokens` and flipping freshly-admitted CONTEXT
    /// requests to DECODE once their prefill step has executed.
    pub fn step(
        &self,
        running: &mut VecDeque<InferRequest>,
        block_manager: &BlockManager,
        runner: &dyn ForwardRunner,
    ) -> Result<()> {
        if running.is_empty() {
            return Ok(());
        }

        let rank = Rank(0);
        let batch = StepBatchBuilder::new(running, rank, block_manager, self.num_layer).build()?;
        let sampled = runner.forward(&batch, rank)?;

        for (req, token) in running.iter_mut().zip(sampled) {
            req.output_tokens.push(token);
            req.infer_stage = InferStage::Decode;
            req.step += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::backend::SimulatedDeviceBackend;
    use crate::config::EngineConfig;
    use crate::request::{Request, SamplingConfig};
    use crate::types::RequestId;
    use std::sync::{mpsc, Arc};

    fn request(id: u64, prompt_len: usize) -> InferRequest {
        let (tx, _rx) = mpsc::channel();
        let req = Request {
            req_id: RequestId(id),
            model_name: "m".into(),
            input_tokens: vec![7; prompt_len],
            sampling_config: SamplingConfig {
                max_new_tokens: 4,
                temperature: 1.0,
                top_k: None,
                top_p: None,
                stop_token_ids: vec![],
            },
        };
        InferRequest::new(req, 1, 64, tx)
    }

    #[test]
    fn context_batch_concatenates_full_prompts() {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        let bm = BlockManager::new(config, backend);

        let mut req = request(1, 3);
        let ids = bm.device(Rank(0)).unwrap().allocate_blocks(1).unwrap();
        req.kv_cache_blocks[0] = ids;
        let mut running = VecDeque::new();
        running.push_back(req);

        let batch = StepBatchBuilder::new(&running, Rank(0), &bm, 2).build().unwrap();
        assert_eq!(batch.input_ids, vec![7, 7, 7]);
        assert_eq!(batch.total_seq_len, 3);
        assert_eq!(batch.kv_cache_offset_list, vec![0, 1]);
        assert_eq!(batch.kv_list.len(), 2 * 1 * 2);
    }

    #[test]
    fn step_advances_context_request_to_decode() {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        let bm = BlockManager::new(config, backend);

        let mut req = request(1, 3);
        let ids = bm.device(Rank(0)).unwrap().allocate_blocks(1).unwrap();
        req.kv_cache_blocks[0] = ids;
        let mut running = VecDeque::new();
        running.push_back(req);

        let driver = StepDriver::new(2);
        driver.step(&mut running, &bm, &SimulatedForwardRunner).unwrap();

        assert_eq!(running[0].infer_stage, InferStage::Decode);
        assert_eq!(running[0].output_tokens.len(), 4);
        assert_eq!(running[0].step, 1);
    }
}
