use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Cancellation handle for one run.
///
/// Soft: nothing new is dispatched or retried, but outputs already acquired
/// are still evaluated. Hard: in-flight acquisitions are aborted and their
/// work discarded. A hard cancel implies a soft one.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    soft: CancellationToken,
    hard: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.soft.cancel();
    }

    pub fn cancel_hard(&self) {
        self.hard.cancel();
        self.soft.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.soft.is_cancelled()
    }

    pub fn is_hard(&self) -> bool {
        self.hard.is_cancelled()
    }

    /// Resolves on any cancellation.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.soft.cancelled()
    }

    pub fn hard_cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.hard.cancelled()
    }
}
