use crate::model::{TestCase, Turn};
use async_trait::async_trait;

/// Drives a full multi-turn scenario against the target.
///
/// The agent owns its step budget; the pipeline only sees the finished
/// turn sequence or an abort.
#[async_trait]
pub trait ConversationAgent: Send + Sync {
    async fn run_scenario(&self, tc: &TestCase) -> Result<Vec<Turn>, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("scenario aborted: {reason}")]
    Aborted { reason: String },
}
