use super::{AcquireContext, OutputProvider, ProviderKind, Target, TargetError};
use crate::errors::AcquisitionError;
use crate::model::{Output, Role, TestCase, Turn};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::timeout;

/// Invokes the live target once with the case prompt.
pub struct SingleTurnOutput {
    target: Arc<dyn Target>,
}

impl SingleTurnOutput {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self { target }
    }
}

#[async_trait]
impl OutputProvider for SingleTurnOutput {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SingleTurn
    }

    async fn acquire(
        &self,
        tc: &TestCase,
        ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        let timeout_ms = ctx.timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        let resp = match timeout(ctx.timeout, self.target.invoke(&tc.prompt)).await {
            Err(_) => return Err(AcquisitionError::TargetTimeout { timeout_ms }),
            Ok(Err(TargetError::Timeout)) => {
                return Err(AcquisitionError::TargetTimeout { timeout_ms })
            }
            Ok(Err(TargetError::Unreachable(detail))) => {
                return Err(AcquisitionError::TargetUnreachable { detail })
            }
            Ok(Err(TargetError::Rejected(detail))) => {
                return Err(AcquisitionError::TargetRejected { detail })
            }
            Ok(Ok(resp)) => resp,
        };

        let turn = Turn {
            role: Role::Assistant,
            content: resp.content,
            tool_calls: resp.tool_calls,
        };
        let mut output = Output::single_turn(tc.prompt.clone(), turn, self.kind().as_str());
        output.meta = serde_json::json!({
            "target": self.target.name(),
            "response_meta": resp.meta,
        });
        Ok(output)
    }
}
