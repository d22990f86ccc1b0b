//! Pure scheduling policy: given queues and free block counts, produce the
//! next running set (spec.md §4.3, the default "continuous batching with
//! swap-based preemption" strategy).

use std::collections::VecDeque;

use tracing::debug;

use crate::batch::state::MainQueues;
use crate::block::manager::BlockManager;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::Result;
use crate::request::{InferRequest, InferStage};
use crate::types::{BlockId, Rank};

/// Policy object invoked once per `Schedule()` call, after intake and the
/// finish sweep have run. Grounded on the teacher's `Scheduler::schedule`
/// two-phase loop (decode first, then prefill admission), generalized to the
/// four-pass grow/victim/resume/admit policy.
pub trait ScheduleStrategy: Send + Sync {
    fn apply(
        &self,
        queues: &mut MainQueues,
        block_manager: &BlockManager,
        context: &Context,
        config: &EngineConfig,
    ) -> Result<()>;
}

/// Token contribution of a request to the current step's budget.
fn token_contribution(req: &InferRequest) -> usize {
    match req.infer_stage {
        InferStage::Context => req.input_tokens.len(),
        InferStage::Decode => 1,
    }
}

fn allocate_one_block_all_ranks(bm: &BlockManager, req: &mut InferRequest) -> Result<bool> {
    let num_ranks = req.kv_cache_blocks.len();
    let mut allocated: Vec<(usize, BlockId)> = Vec::new();
    for r in 0..num_ranks {
        match bm.device(Rank(r))?.allocate_blocks(1) {
            Ok(ids) => allocated.push((r, ids[0])),
            Err(crate::error::Error::OutOfDeviceMemory { .. }) => {
                for (rank, id) in allocated {
                    bm.device(Rank(rank))?.free_blocks(&[id])?;
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
    for (rank, id) in allocated {
        req.kv_cache_blocks[rank].push(id);
    }
    Ok(true)
}

fn allocate_context_blocks_all_ranks(bm: &BlockManager, req: &mut InferRequest, n: usize) -> Result<bool> {
    let num_ranks = req.kv_cache_blocks.len();
    let mut allocated: Vec<(usize, Vec<BlockId>)> = Vec::new();
    for r in 0..num_ranks {
        match bm.device(Rank(r))?.allocate_blocks(n) {
            Ok(ids) => allocated.push((r, ids)),
            Err(crate::error::Error::OutOfDeviceMemory { .. }) => {
                for (rank, ids) in allocated {
                    bm.device(Rank(rank))?.free_blocks(&ids)?;
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
    for (rank, ids) in allocated {
        req.kv_cache_blocks[rank] = ids;
    }
    Ok(true)
}

fn swap_out_request(bm: &BlockManager, ctx: &Context, req: &mut InferRequest) -> Result<()> {
    for r in 0..req.kv_cache_blocks.len() {
        let host_ids = bm.swap_out(ctx, Rank(r), &req.kv_cache_blocks[r])?;
        req.host_blocks[r] = host_ids;
        req.kv_cache_blocks[r].clear();
    }
    Ok(())
}

fn swap_in_request(bm: &BlockManager, ctx: &Context, req: &mut InferRequest) -> Result<()> {
    for r in 0..req.host_blocks.len() {
        let device_ids = bm.swap_in(ctx, Rank(r), &req.host_blocks[r])?;
        req.kv_cache_blocks[r] = device_ids;
        req.host_blocks[r].clear();
    }
    Ok(())
}

/// Continuous batching with swap-based preemption: grow running decode
/// requests, evict the newest-arrived request (LIFO) when a grow can't be
/// satisfied, resume swapped requests as space frees up, then admit from the
/// waiting queue while budget and blocks allow.
pub struct ContinuousBatchingStrategy;

impl ScheduleStrategy for ContinuousBatchingStrategy {
    fn apply(
        &self,
        queues: &mut MainQueues,
        bm: &BlockManager,
        ctx: &Context,
        config: &EngineConfig,
    ) -> Result<()> {
        self.grow_running(&mut queues.running_queue, &mut queues.swapped_queue, bm, ctx, config)?;

        let mut used_tokens: usize = queues.running_queue.iter().map(token_contribution).sum();

        self.resume_swapped(&mut queues.running_queue, &mut queues.swapped_queue, bm, ctx, config, &mut used_tokens)?;
        self.admit_waiting(&mut queues.running_queue, &mut queues.waiting_queue, bm, config, &mut used_tokens)?;
        Ok(())
    }
}

impl ContinuousBatchingStrategy {
    fn grow_running(
        &self,
        running: &mut VecDeque<InferRequest>,
        swapped: &mut VecDeque<InferRequest>,
        bm: &BlockManager,
        ctx: &Context,
        config: &EngineConfig,
    ) -> Result<()> {
        let mut i = 0;
        while i < running.len() {
            let needs_growth = {
                let req = &running[i];
                req.infer_stage == InferStage::Decode
                    && config.blocks_for_tokens(req.output_tokens.len()) > req.blocks_held(0)
            };
            if !needs_growth {
                i += 1;
                continue;
            }

            loop {
                let grown = allocate_one_block_all_ranks(bm, running.get_mut(i).unwrap())?;
                if grown {
                    break;
                }
                if running.len() <= i + 1 {
                    // No one left behind the head to evict; swap the head
                    // itself out and leave it swapped rather than fail it.
                    let mut victim = running.remove(i).unwrap();
                    swap_out_request(bm, ctx, &mut victim)?;
                    debug!(req_id = %victim.req_id, "swapping head request, no room to grow");
                    swapped.push_back(victim);
                    break;
                }
                let mut victim = running.pop_back().unwrap();
                swap_out_request(bm, ctx, &mut victim)?;
                debug!(req_id = %victim.req_id, "evicting newest-arrived request to grow head");
                swapped.push_back(victim);
            }
            i += 1;
        }
        Ok(())
    }

    fn resume_swapped(
        &self,
        running: &mut VecDeque<InferRequest>,
        swapped: &mut VecDeque<InferRequest>,
        bm: &BlockManager,
        ctx: &Context,
        config: &EngineConfig,
        used_tokens: &mut usize,
    ) -> Result<()> {
        while let Some(front) = swapped.front() {
            if running.len() >= config.max_batch_size {
                break;
            }
            let needed = front.host_blocks[0].len();
            let free = bm.device(Rank(0))?.get_free_block_number();
            let contribution = token_contribution(front);
            if free < needed || *used_tokens + contribution > config.max_step_tokens {
                break;
            }
            let mut req = swapped.pop_front().unwrap();
            swap_in_request(bm, ctx, &mut req)?;
            *used_tokens += contribution;
            running.push_back(req);
        }
        Ok(())
    }

    fn admit_waiting(
        &self,
        running: &mut VecDeque<InferRequest>,
        waiting: &mut VecDeque<InferRequest>,
        bm: &BlockManager,
        config: &EngineConfig,
        used_tokens: &mut usize,
    ) -> Result<()> {
        while running.len() < config.max_batch_size {
            let Some(front) = waiting.front() else {
                break;
            };
            let prompt_len = front.input_tokens.len();
            let blocks_needed = config.blocks_for_tokens(prompt_len);
            let free = bm.device(Rank(0))?.get_free_block_number();
            if free < blocks_needed || *used_tokens + prompt_len > config.max_step_tokens {
                break;
            }
            let mut req = waiting.pop_front().unwrap();
            if !allocate_context_blocks_all_ranks(bm, &mut req, blocks_needed)? {
                // Lost a race with another consumer of free block counts;
                // push back and stop admitting this step.
                waiting.push_front(req);
                break;
            }
            *used_tokens += prompt_len;
            running.push_back(req);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::backend::SimulatedDeviceBackend;
    use crate::request::{Request, SamplingConfig};
    use std::sync::{mpsc, Arc};

    fn bm(blocks_num: usize, block_token_num: usize) -> BlockManager {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num,
            block_size: 64,
            block_token_num,
            block_host_memory_factor: 2.0,
            max_batch_size: 8,
            max_step_tokens: 64,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        BlockManager::new(config, backend)
    }

    fn infer_request(id: u64, prompt_len: usize, max_new_tokens: usize) -> InferRequest {
        let (tx, _rx) = mpsc::channel();
        let req = Request {
            req_id: crate::types::RequestId(id),
            model_name: "m".into(),
            input_tokens: vec![1; prompt_len],
            sampling_config: SamplingConfig {
                max_new_tokens,
                temperature: 1.0,
                top_k: None,
                top_p: None,
                stop_token_ids: vec![],
            },
        };
        InferRequest::new(req, 1, 64, tx)
    }

    #[test]
    fn admits_from_waiting_when_blocks_available() {
        let manager = bm(4, 4);
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 4,
            block_size: 64,
            block_token_num: 4,
            max_batch_size: 8,
            max_step_tokens: 64,
            ..EngineConfig::default()
        };
        let mut queues = MainQueues::default();
        queues.waiting_queue.push_back(infer_request(1, 4, 2));
        let strategy = ContinuousBatchingStrategy;
        let ctx = Context::new(1);
        strategy.apply(&mut queues, &manager, &ctx, &config).unwrap();
        assert_eq!(queues.running_queue.len(), 1);
        assert_eq!(queues.running_queue[0].kv_cache_blocks[0].len(), 1);
    }

    #[test]
    fn admission_respects_free_block_shortage() {
        let manager = bm(1, 4);
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 1,
            block_size: 64,
            block_token_num: 4,
            max_batch_size: 8,
            max_step_tokens: 64,
            ..EngineConfig::default()
        };
        let mut queues = MainQueues::default();
        queues.waiting_queue.push_back(infer_request(1, 8, 2));
        let strategy = ContinuousBatchingStrategy;
        let ctx = Context::new(1);
        strategy.apply(&mut queues, &manager, &ctx, &config).unwrap();
        assert_eq!(queues.running_queue.len(), 0);
        assert_eq!(queues.waiting_queue.len(), 1);
    }
}
