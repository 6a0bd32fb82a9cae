use super::{AcquireContext, AgentError, ConversationAgent, OutputProvider, ProviderKind};
use crate::errors::AcquisitionError;
use crate::model::{Output, TestCase};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::timeout;

/// Runs the whole scenario through the conversation agent.
pub struct MultiTurnOutput {
    agent: Arc<dyn ConversationAgent>,
}

impl MultiTurnOutput {
    pub fn new(agent: Arc<dyn ConversationAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl OutputProvider for MultiTurnOutput {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MultiTurn
    }

    async fn acquire(
        &self,
        tc: &TestCase,
        ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        // A conversation is not replayed on timeout; the agent owns its steps.
        let turns = timeout(ctx.timeout, self.agent.run_scenario(tc))
            .await
            .map_err(|_| AcquisitionError::ConversationAborted {
                reason: format!(
                    "conversation exceeded {}ms",
                    ctx.timeout.as_millis().min(u128::from(u64::MAX))
                ),
            })?
            .map_err(|AgentError::Aborted { reason }| AcquisitionError::ConversationAborted {
                reason,
            })?;
        if turns.is_empty() {
            return Err(AcquisitionError::ConversationAborted {
                reason: "agent produced no turns".into(),
            });
        }
        Ok(Output::multi_turn(
            tc.prompt.clone(),
            turns,
            self.kind().as_str(),
        ))
    }
}
