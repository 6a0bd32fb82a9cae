use super::cancel::CancelSignal;
use super::orchestrator::{Orchestrator, PlannedCase};
use super::retry::RetryPolicy;
use super::ProgressSink;
use crate::errors::OrchestrationResult;
use crate::model::{MetricSpec, OutputSource, TestRun};
use crate::providers::TestResultOutput;
use std::sync::Arc;
use tracing::info;

/// Re-evaluates the stored outputs of a finished run into a new run.
///
/// The target is never contacted: every case is acquired through
/// [`TestResultOutput`] with a single attempt. The source run and its
/// results are only read.
#[derive(Clone)]
pub struct RescoreService {
    orchestrator: Orchestrator,
}

impl RescoreService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub async fn rescore_test_run(
        &self,
        run_id: &str,
        metric_overrides: Option<Vec<MetricSpec>>,
    ) -> OrchestrationResult<TestRun> {
        self.rescore_with(run_id, metric_overrides, &CancelSignal::new(), None)
            .await
    }

    pub async fn rescore_with(
        &self,
        run_id: &str,
        metric_overrides: Option<Vec<MetricSpec>>,
        cancel: &CancelSignal,
        progress: Option<ProgressSink>,
    ) -> OrchestrationResult<TestRun> {
        let source = self.orchestrator.load_finished_run(run_id)?;

        let mut configuration = source.configuration.clone();
        configuration.output_source = OutputSource::Rescore {
            source_run_id: source.id.clone(),
        };
        if let Some(m) = &metric_overrides {
            configuration.metric_overrides = Some(m.clone());
        }
        let metrics = metric_overrides.unwrap_or_else(|| source.metrics.clone());

        let store = self.orchestrator.store().clone();
        let planned: Vec<PlannedCase> = source
            .results
            .iter()
            .map(|r| PlannedCase {
                index: r.case_index,
                test_case: r.test_case.clone(),
                provider: Arc::new(TestResultOutput::new(store.clone(), r.id.clone())),
                rescored_from: Some(r.id.clone()),
            })
            .collect();

        let mut run = TestRun::new(configuration, metrics, planned.len());
        run.rescored_from = Some(source.id.clone());
        info!(
            source_run_id = %source.id,
            run_id = %run.id,
            results = planned.len(),
            "rescoring test run"
        );

        self.orchestrator
            .run_planned(run, planned, RetryPolicy::none(), cancel, progress)
            .await
    }
}
