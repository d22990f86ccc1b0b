//! Request queues, scheduling policy, and the batch scheduler (spec.md §4.3,
//! C4/C5/C6).

pub mod scheduler;
pub mod state;
pub mod strategy;

pub use scheduler::BatchScheduler;
pub use state::{BatchState, MainQueues};
pub use strategy::{ContinuousBatchingStrategy, ScheduleStrategy};
