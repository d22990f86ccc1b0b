//! Top-level driver thread: owns the scheduler and runs `Schedule`/`Step` in
//! a loop until stopped (spec.md §4.5, C8).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::batch::{BatchScheduler, BatchState, ContinuousBatchingStrategy};
use crate::block::manager::BlockManager;
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::Result;
use crate::request::{FinishReason, Request, RequestOutcome};
use crate::step::{ForwardRunner, StepDriver};
use crate::types::RequestId;

use std::sync::mpsc;

/// Wakes the driver thread whenever a new request arrives or `stop` is
/// called, mirroring the teacher's condition-variable-gated worker loop.
/// `woken` is checked and cleared under the same lock the condvar waits on,
/// so a notify that lands between a `schedule()` call and the wait can't be
/// lost.
struct DriverSignal {
    terminated: bool,
    woken: bool,
}

struct Waiter {
    signal: Mutex<DriverSignal>,
    condvar: Condvar,
}

/// Owns the single driver thread that runs `scheduled = Schedule(); if
/// (empty) wait(); else Step(scheduled); repeat` (spec.md §4.5).
pub struct BatchManager {
    state: Arc<BatchState>,
    scheduler: Arc<BatchScheduler>,
    block_manager: Arc<BlockManager>,
    runner: Arc<dyn ForwardRunner>,
    num_layer: usize,
    waiter: Arc<Waiter>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BatchManager {
    pub fn new(
        config: EngineConfig,
        block_manager: Arc<BlockManager>,
        runner: Arc<dyn ForwardRunner>,
        num_layer: usize,
    ) -> Self {
        let state = Arc::new(BatchState::new());
        let context = Arc::new(Context::new(config.tensor_para_size));
        let scheduler = Arc::new(BatchScheduler::new(
            state.clone(),
            block_manager.clone(),
            context,
            Box::new(ContinuousBatchingStrategy),
            config,
        ));

        Self {
            state,
            scheduler,
            block_manager,
            runner,
            num_layer,
            waiter: Arc::new(Waiter {
                signal: Mutex::new(DriverSignal {
                    terminated: false,
                    woken: false,
                }),
                condvar: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Wraps `req` in an `InferRequest`, hands it to the scheduler, and
    /// notifies the driver's waiter.
    pub fn enqueue(&self, req: Request) -> Result<(RequestId, mpsc::Receiver<RequestOutcome>)> {
        let (req_id, rx) = self.scheduler.add_infer_request(req)?;
        self.waiter.signal.lock().unwrap().woken = true;
        self.waiter.condvar.notify_all();
        Ok((req_id, rx))
    }

    /// Spawns the driver thread. Calling this twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return;
        }
        let this = self.clone();
        *thread = Some(std::thread::spawn(move || this.drive()));
    }

    fn drive(&self) {
        let step_driver = StepDriver::new(self.num_layer);
        info!("batch manager driver thread started");
        loop {
            if self.waiter.signal.lock().unwrap().terminated {
                break;
            }

            let has_work = match self.scheduler.schedule() {
                Ok(has_work) => has_work,
                Err(e) => {
                    tracing::error!(error = %e, "schedule failed");
                    false
                }
            };

            if has_work {
                let mut main = self.state.main.lock().unwrap();
                if let Err(e) = step_driver.step(&mut main.running_queue, &self.block_manager, self.runner.as_ref()) {
                    tracing::error!(error = %e, "step failed");
                }
                continue;
            }

            let mut signal = self.waiter.signal.lock().unwrap();
            while !signal.terminated && !signal.woken {
                signal = self.waiter.condvar.wait(signal).unwrap();
            }
            signal.woken = false;
            if signal.terminated {
                break;
            }
        }
        debug!("batch manager driver thread exiting");
    }

    /// Sets the terminated flag, wakes the driver, and joins its thread. The
    /// driver never interrupts an in-flight step; once it exits, every
    /// request still queued or running is marked finished and its blocks
    /// released, so no caller is left waiting on a dropped notifier.
    pub fn stop(&self) {
        self.waiter.signal.lock().unwrap().terminated = true;
        self.waiter.condvar.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.finish_all_pending("stopped");
    }

    fn finish_all_pending(&self, message: &str) {
        let mut buffer = self.state.buffer.lock().unwrap();
        let mut main = self.state.main.lock().unwrap();
        for mut req in buffer.drain(..) {
            req.finish(crate::request::FinishReason::Error, Some(message.to_string()));
        }
        for queue in [&mut main.waiting_queue, &mut main.running_queue, &mut main.swapped_queue] {
            for mut req in queue.drain(..) {
                for r in 0..req.kv_cache_blocks.len() {
                    let _ = self.block_manager.device(crate::types::Rank(r)).map(|a| a.free_blocks(&req.kv_cache_blocks[r]));
                }
                for r in 0..req.host_blocks.len() {
                    let _ = self.block_manager.host().free_blocks(&req.host_blocks[r]);
                }
                req.finish(crate::request::FinishReason::Error, Some(message.to_string()));
            }
        }
    }

    pub fn state(&self) -> &Arc<BatchState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::backend::SimulatedDeviceBackend;
    use crate::request::SamplingConfig;
    use crate::step::SimulatedForwardRunner;

    #[test]
    fn enqueue_and_drain_single_request() {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            max_batch_size: 8,
            max_step_tokens: 64,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        let block_manager = Arc::new(BlockManager::new(config.clone(), backend));
        let manager = Arc::new(BatchManager::new(
            config,
            block_manager,
            Arc::new(SimulatedForwardRunner),
            2,
        ));
        manager.start();

        let (_id, rx) = manager
            .enqueue(Request {
                req_id: RequestId(1),
                model_name: "m".into(),
                input_tokens: vec![1, 2, 3],
                sampling_config: SamplingConfig {
                    max_new_tokens: 1,
                    temperature: 1.0,
                    top_k: None,
                    top_p: None,
                    stop_token_ids: vec![],
                },
            })
            .unwrap();

        let outcome = rx.recv_timeout(std::time::Duration::from_secs(5)).expect("request finishes");
        assert_eq!(outcome.req_id, RequestId(1));
        assert_eq!(outcome.output_tokens.len(), 4);

        manager.stop();
    }

    #[test]
    fn stop_finishes_requests_still_in_flight() {
        let config = EngineConfig {
            tensor_para_size: 1,
            blocks_num: 8,
            block_size: 64,
            block_token_num: 4,
            max_batch_size: 8,
            max_step_tokens: 64,
            ..EngineConfig::default()
        };
        let backend = Arc::new(SimulatedDeviceBackend::new(1, 1 << 20, 1 << 20, 1 << 20));
        let block_manager = Arc::new(BlockManager::new(config.clone(), backend));
        let manager = Arc::new(BatchManager::new(
            config,
            block_manager,
            Arc::new(SimulatedForwardRunner),
            2,
        ));
        manager.start();

        let (_id, rx) = manager
            .enqueue(Request {
                req_id: RequestId(1),
                model_name: "m".into(),
                input_tokens: vec![1, 2, 3],
                sampling_config: SamplingConfig {
                    max_new_tokens: 1_000_000,
                    temperature: 1.0,
                    top_k: None,
                    top_p: None,
                    stop_token_ids: vec![],
                },
            })
            .unwrap();

        manager.stop();
        let outcome = rx.recv_timeout(std::time::Duration::from_secs(5)).expect("stop finishes in-flight requests");
        assert_eq!(outcome.finish_reason, FinishReason::Error);
        let stats = manager.block_manager.stats();
        assert_eq!(stats.device_used.iter().sum::<usize>(), 0);
    }
}
