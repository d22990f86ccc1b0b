//! The four request queues and their guarding mutexes (spec.md §3, §4.3).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::request::InferRequest;

/// Queues mutated only inside `Schedule`, under `BatchState::main`.
#[derive(Default)]
pub struct MainQueues {
    pub waiting_queue: VecDeque<InferRequest>,
    pub running_queue: VecDeque<InferRequest>,
    pub swapped_queue: VecDeque<InferRequest>,
}

/// Holds the newly-enqueued buffer queue (contended by producer threads) and
/// the three scheduler-owned queues (touched only inside `Schedule`), each
/// behind its own mutex so producers never block on the scheduler.
#[derive(Default)]
pub struct BatchState {
    pub buffer: Mutex<VecDeque<InferRequest>>,
    pub main: Mutex<MainQueues>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_buffered(&self, req: InferRequest) {
        self.buffer.lock().unwrap().push_back(req);
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_idle(&self) -> bool {
        if !self.buffer.lock().unwrap().is_empty() {
            return false;
        }
        let main = self.main.lock().unwrap();
        main.waiting_queue.is_empty() && main.running_queue.is_empty() && main.swapped_queue.is_empty()
    }
}
