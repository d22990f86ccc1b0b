//! Admission gate and per-step orchestration (spec.md §4.3, C6).

use std::sync::{mpsc, Arc};

use crate::batch::strategy::ScheduleStrategy;
use crate::block::manager::BlockManager;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::request::{FinishReason, InferRequest, Request, RequestOutcome};
use crate::types::{RequestId, Rank};

use super::state::BatchState;

fn check_finished(req: &InferRequest) -> Option<(FinishReason, Option<String>)> {
    if req.generated_len() >= req.sampling_config.max_new_tokens {
        return Some((FinishReason::Length, None));
    }
    if req.generated_len() > 0 {
        if let Some(&last) = req.output_tokens.last() {
            if req.sampling_config.stop_token_ids.contains(&last) {
                return Some((FinishReason::Eos, None));
            }
        }
    }
    None
}

/// Drives `Schedule()`: intake, finish sweep, then the pluggable strategy
/// step. Called once per step by the batch manager's driver thread.
pub struct BatchScheduler {
    state: Arc<BatchState>,
    block_manager: Arc<BlockManager>,
    context: Arc<Context>,
    strategy: Box<dyn ScheduleStrategy>,
    config: EngineConfig,
}

impl BatchScheduler {
    pub fn new(
        state: Arc<BatchState>,
        block_manager: Arc<BlockManager>,
        context: Arc<Context>,
        strategy: Box<dyn ScheduleStrategy>,
        config: EngineConfig,
    ) -> Self {
        Self {
            state,
            block_manager,
            context,
            strategy,
            config,
        }
    }

    pub fn state(&self) -> &Arc<BatchState> {
        &self.state
    }

    /// Reject on `ExceedLength` immediately; otherwise enqueue into the
    /// buffer queue and return the receiving half of the request's notifier.
    pub fn add_infer_request(&self, req: Request) -> Result<(RequestId, mpsc::Receiver<RequestOutcome>)> {
        if req.input_tokens.len() > self.config.max_token_len {
            return Err(Error::ExceedLength {
                len: req.input_tokens.len(),
                limit: self.config.max_token_len,
            });
        }

        let (tx, rx) = mpsc::channel();
        {
            let buffer = self.state.buffer.lock().unwrap();
            let main = self.state.main.lock().unwrap();
            let len = buffer.len() + main.waiting_queue.len();
            if len >= self.config.max_waiting_queue_len {
                return Err(Error::ExceedCapacity {
                    len,
                    limit: self.config.max_waiting_queue_len,
                });
            }
        }

        let infer = InferRequest::new(req, self.config.tensor_para_size, self.config.block_size, tx);
        let req_id = infer.req_id;
        self.state.push_buffered(infer);
        Ok((req_id, rx))
    }

    /// Runs the three passes described in spec.md §4.3 and reports whether
    /// `running_queue` holds work for the step driver to execute.
    pub fn schedule(&self) -> Result<bool> {
        {
            let mut buffer = self.state.buffer.lock().unwrap();
            if !buffer.is_empty() {
                let mut main = self.state.main.lock().unwrap();
                while let Some(req) = buffer.pop_front() {
                    main.waiting_queue.push_back(req);
                }
            }
        }

        let mut main = self.state.main.lock().unwrap();

        let mut i = 0;
        while i < main.running_queue.len() {
            let finished = check_finished(&main.running_queue[i]);
            if let Some((reason, err)) = finished {
                let mut req = main.running_queue.remove(i).unwrap();
                for r in 0..req.kv_cache_blocks.len() {
                    self.block_manager.device(Rank(r))?.free_blocks(&req.kv_cache_blocks[r])?;
                    req.kv_cache_blocks[r].clear();
                }
                req.finish(reason, err);
            } else {
                i += 1;
            }
        }

        self.strategy
            .apply(&mut main, &self.block_manager, &self.context, &self.config)?;
        Ok(!main.running_queue.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::strategy::ContinuousBatchingStrategy;
    use crate::block::backend::SimulatedDeviceBackend;
    use crate::request::SamplingConfig;

    fn scheduler(max_waiting_queue_len: usize, max_token_len: usize) -> BatchScheduler {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            max_batch_size: 8,
            max_step_tokens: 64,
            max_waiting_queue_len,
            max_token_len,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        let block_manager = Arc::new(BlockManager::new(config.clone(), backend));
        BatchScheduler::new(
            Arc::new(BatchState::new()),
            block_manager,
            Arc::new(Context::new(1)),
            Box::new(ContinuousBatchingStrategy),
            config,
        )
    }

    fn request(id: u64, prompt_len: usize) -> Request {
        Request {
            req_id: RequestId(id),
            model_name: "m".into(),
            input_tokens: vec![1; prompt_len],
            sampling_config: SamplingConfig {
                max_new_tokens: 2,
                temperature: 1.0,
                top_k: None,
                top_p: None,
                stop_token_ids: vec![],
            },
        }
    }

    #[test]
    fn rejects_prompt_exceeding_max_token_len() {
        let s = scheduler(8, 4);
        let err = s.add_infer_request(request(1, 5)).unwrap_err();
        assert!(matches!(err, Error::ExceedLength { .. }));
    }

    #[test]
    fn accepts_prompt_exactly_at_max_token_len() {
        let s = scheduler(8, 4);
        assert!(s.add_infer_request(request(1, 4)).is_ok());
    }

    #[test]
    fn rejects_when_waiting_queue_at_capacity() {
        let s = scheduler(2, 32);
        assert!(s.add_infer_request(request(1, 4)).is_ok());
        assert!(s.add_infer_request(request(2, 4)).is_ok());
        let err = s.add_infer_request(request(3, 4)).unwrap_err();
        assert!(matches!(err, Error::ExceedCapacity { .. }));
    }

    #[test]
    fn accepts_up_to_limit_minus_one_then_rejects_at_limit() {
        let s = scheduler(3, 32);
        assert!(s.add_infer_request(request(1, 4)).is_ok());
        assert!(s.add_infer_request(request(2, 4)).is_ok());
        assert!(s.add_infer_request(request(3, 4)).is_ok());
        let err = s.add_infer_request(request(4, 4)).unwrap_err();
        assert!(matches!(err, Error::ExceedCapacity { .. }));
    }

    #[test]
    fn schedule_admits_buffered_request_into_running() {
        let s = scheduler(8, 32);
        let (_id, _rx) = s.add_infer_request(request(1, 4)).unwrap();
        let has_work = s.schedule().unwrap();
        assert!(has_work);
        assert_eq!(s.state().main.lock().unwrap().running_queue.len(), 1);
    }
}
