//! Shared application state: the engine handle and a table of outcomes
//! filed by the blocking notifier bridge (see `api::requests`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stratum_core::{BatchManager, BlockManager, RequestId, RequestOutcome};

/// Cloned into every handler by axum's `State` extractor. The sync core
/// drives requests to completion on its own thread; `outcomes` is how an
/// async poller learns the result without blocking on the core's
/// `std::sync::mpsc::Receiver` directly, mirroring how the teacher's
/// `ModelManager` bridges a blocking model load via `spawn_blocking`.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BatchManager>,
    pub block_manager: Arc<BlockManager>,
    pub outcomes: Arc<Mutex<HashMap<RequestId, RequestOutcome>>>,
    pub cors_enabled: bool,
}

impl AppState {
    pub fn new(manager: Arc<BatchManager>, block_manager: Arc<BlockManager>, cors_enabled: bool) -> Self {
        Self {
            manager,
            block_manager,
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            cors_enabled,
        }
    }
}
