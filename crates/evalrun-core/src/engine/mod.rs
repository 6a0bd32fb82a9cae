pub mod cancel;
pub mod orchestrator;
pub mod rescore;
pub mod retry;
pub mod runner;

use std::sync::Arc;

pub use cancel::CancelSignal;
pub use orchestrator::Orchestrator;
pub use rescore::RescoreService;
pub use retry::RetryPolicy;
pub use runner::{Runner, RunnerOutcome, RunnerState};

/// One progress update: how many test cases are done and the total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
}

/// Called each time a test case reaches `Done`, in completion order.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
