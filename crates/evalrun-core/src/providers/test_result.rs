use super::{AcquireContext, OutputProvider, ProviderKind};
use crate::errors::AcquisitionError;
use crate::model::{Output, TestCase};
use crate::storage::Persistence;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Replays the output of a stored TestResult verbatim. Never touches the target.
pub struct TestResultOutput {
    store: Arc<dyn Persistence>,
    result_id: String,
}

impl TestResultOutput {
    pub fn new(store: Arc<dyn Persistence>, result_id: impl Into<String>) -> Self {
        Self {
            store,
            result_id: result_id.into(),
        }
    }
}

#[async_trait]
impl OutputProvider for TestResultOutput {
    fn kind(&self) -> ProviderKind {
        ProviderKind::TestResult
    }

    async fn acquire(
        &self,
        _tc: &TestCase,
        _ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        let not_found = || AcquisitionError::ResultNotFound {
            result_id: self.result_id.clone(),
        };
        let stored = match self.store.load_test_result(&self.result_id) {
            Ok(Some(r)) => r,
            Ok(None) => return Err(not_found()),
            Err(e) => {
                warn!(result_id = %self.result_id, error = %e, "failed to load stored result");
                return Err(not_found());
            }
        };
        // A stored failure has nothing to replay.
        stored.output.ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestResult, TestResultStatus, Turn};
    use crate::storage::Store;
    use std::time::Duration;

    fn stored(output: Option<Output>) -> TestResult {
        TestResult {
            id: "res-1".into(),
            run_id: "run-1".into(),
            case_index: 0,
            test_case: TestCase::single_turn("t1", "ping"),
            status: if output.is_some() {
                TestResultStatus::Completed
            } else {
                TestResultStatus::Failed
            },
            provider: "single_turn".into(),
            output,
            metrics: vec![],
            attempts: vec![],
            retries: 0,
            error: None,
            error_kind: None,
            rescored_from: None,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
        }
    }

    fn store() -> Arc<dyn Persistence> {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        Arc::new(s)
    }

    #[tokio::test]
    async fn replays_stored_output_verbatim() {
        let store = store();
        let out = Output::single_turn("ping", Turn::assistant("pong"), "single_turn");
        store.save_test_result(&stored(Some(out.clone()))).unwrap();

        let provider = TestResultOutput::new(store, "res-1");
        let got = provider
            .acquire(
                &TestCase::single_turn("t1", "ping"),
                &AcquireContext::new("run-2", Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(got, out);
    }

    #[tokio::test]
    async fn missing_or_empty_result_is_not_found() {
        let store = store();
        store.save_test_result(&stored(None)).unwrap();
        let ctx = AcquireContext::new("run-2", Duration::from_secs(1));
        let tc = TestCase::single_turn("t1", "ping");

        let err = TestResultOutput::new(store.clone(), "gone")
            .acquire(&tc, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "result_not_found");

        let err = TestResultOutput::new(store, "res-1")
            .acquire(&tc, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "result_not_found");
    }
}
