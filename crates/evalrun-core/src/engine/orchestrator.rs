//! Expands a test configuration into per-case work and aggregates the run.

use super::cancel::CancelSignal;
use super::retry::RetryPolicy;
use super::runner::{Runner, RunnerOutcome};
use super::{ProgressEvent, ProgressSink};
use crate::config::EngineConfig;
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::evaluator::{panic_message, MetricEvaluator};
use crate::jobs::{Job, JobHandle, JobHandler, JobKind, JobRegistry, TaskQueue};
use crate::model::{
    ExecutionMode, MetricSpec, OutputSource, RunStatus, TestCase, TestConfiguration, TestResult,
    TestResultStatus, TestRun, TestSet,
};
use crate::providers::{
    select_provider, AcquireContext, OutputProvider, Providers, UnavailableProvider,
};
use crate::storage::{Persistence, SaveOutcome};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A test case with its provider already resolved.
pub(crate) struct PlannedCase {
    pub index: usize,
    pub test_case: TestCase,
    pub provider: Arc<dyn OutputProvider>,
    pub rescored_from: Option<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    providers: Providers,
    evaluator: MetricEvaluator,
    store: Arc<dyn Persistence>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(providers: Providers, evaluator: MetricEvaluator, config: EngineConfig) -> Self {
        let store = providers.store.clone();
        Self {
            providers,
            evaluator,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registry wiring both job kinds to this orchestrator.
    pub fn job_registry(self: &Arc<Self>) -> JobRegistry {
        JobRegistry::new()
            .with(JobKind::ExecuteTestCase, self.clone())
            .with(JobKind::FinalizeRun, self.clone())
    }

    pub async fn execute(&self, cfg: &TestConfiguration) -> OrchestrationResult<TestRun> {
        self.execute_with(cfg, &CancelSignal::new(), None).await
    }

    /// Runs every case of the bound test set and persists the aggregated run.
    ///
    /// Returns once every dispatched case has reached `Done`.
    pub async fn execute_with(
        &self,
        cfg: &TestConfiguration,
        cancel: &CancelSignal,
        progress: Option<ProgressSink>,
    ) -> OrchestrationResult<TestRun> {
        let (set, metrics) = self.prepare(cfg)?;
        let source = self.rescore_source(cfg)?;

        let planned: Vec<PlannedCase> = set
            .cases
            .iter()
            .enumerate()
            .map(|(i, tc)| self.plan_case(cfg, i, tc, source.as_ref()))
            .collect();

        let mut run = TestRun::new(cfg.clone(), metrics, planned.len());
        run.rescored_from = source.map(|s| s.id);
        self.run_planned(run, planned, self.config.retry.clone(), cancel, progress)
            .await
    }

    fn prepare(&self, cfg: &TestConfiguration) -> OrchestrationResult<(TestSet, Vec<MetricSpec>)> {
        cfg.validate()
            .map_err(OrchestrationError::InvalidConfiguration)?;
        let set = self
            .store
            .load_test_set(&cfg.test_set_id)?
            .ok_or_else(|| OrchestrationError::TestSetNotFound(cfg.test_set_id.clone()))?;
        set.validate()
            .map_err(OrchestrationError::InvalidConfiguration)?;
        let metrics = cfg.effective_metrics(&set);
        Ok((set, metrics))
    }

    /// Loads a run that must exist and be in a terminal status.
    pub(crate) fn load_finished_run(&self, run_id: &str) -> OrchestrationResult<TestRun> {
        let run = self
            .store
            .load_test_run(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        if !run.status.is_terminal() {
            return Err(OrchestrationError::RunNotFinished {
                run_id: run_id.to_string(),
                status: run.status.as_str().to_string(),
            });
        }
        Ok(run)
    }

    fn rescore_source(&self, cfg: &TestConfiguration) -> OrchestrationResult<Option<TestRun>> {
        match &cfg.output_source {
            OutputSource::Rescore { source_run_id } => {
                self.load_finished_run(source_run_id).map(Some)
            }
            OutputSource::Live | OutputSource::Trace => Ok(None),
        }
    }

    fn plan_case(
        &self,
        cfg: &TestConfiguration,
        index: usize,
        tc: &TestCase,
        source: Option<&TestRun>,
    ) -> PlannedCase {
        let kind = select_provider(&cfg.output_source, tc.mode);
        let source_result_id = source.and_then(|run| {
            run.results
                .iter()
                .find(|r| r.test_case_id() == tc.id)
                .map(|r| r.id.clone())
        });

        let provider: Arc<dyn OutputProvider> =
            match self.providers.build(kind, &cfg.target, source_result_id.as_deref()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(test_case_id = %tc.id, provider = kind.as_str(), error = %e, "provider unavailable");
                    Arc::new(UnavailableProvider::new(kind, e))
                }
            };

        PlannedCase {
            index,
            test_case: tc.clone(),
            provider,
            rescored_from: source_result_id,
        }
    }

    fn executor(
        &self,
        run_id: &str,
        metrics: Vec<MetricSpec>,
        retry: RetryPolicy,
        cancel: &CancelSignal,
    ) -> CaseExecutor {
        CaseExecutor {
            evaluator: self.evaluator.clone(),
            store: self.store.clone(),
            retry,
            metrics: Arc::new(metrics),
            ctx: AcquireContext::new(run_id, self.config.acquire_timeout()).with_cancel(cancel.clone()),
        }
    }

    pub(crate) async fn run_planned(
        &self,
        mut run: TestRun,
        planned: Vec<PlannedCase>,
        retry: RetryPolicy,
        cancel: &CancelSignal,
        progress: Option<ProgressSink>,
    ) -> OrchestrationResult<TestRun> {
        run.status = RunStatus::Running;
        self.store.save_test_run(&run)?;

        let total = planned.len();
        let exec = self.executor(&run.id, run.metrics.clone(), retry, cancel);
        info!(
            run_id = %run.id,
            configuration_id = %run.configuration.id,
            total,
            execution = ?run.configuration.execution,
            "test run started"
        );

        let mut results = match run.configuration.execution {
            ExecutionMode::Sequential => {
                run_sequential(&exec, planned, cancel, progress.as_ref()).await
            }
            ExecutionMode::Parallel { concurrency } => {
                let limit = self.config.effective_concurrency(concurrency);
                run_parallel(&exec, planned, limit, cancel, progress.as_ref()).await
            }
        };

        // Completion order is arbitrary; the case index is the slot key.
        results.sort_by_key(|r| r.case_index);

        run.status = if cancel.is_cancelled() && results.len() < total {
            RunStatus::Cancelled
        } else {
            RunStatus::aggregate(&results, total)
        };
        run.results = results;
        run.finished_at = Some(Utc::now());
        self.store.save_test_run(&run)?;

        let summary = run.summary();
        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            completed = summary.completed,
            partial = summary.partial,
            failed = summary.failed,
            missing = total - run.results.len(),
            "test run finished"
        );
        Ok(run)
    }

    /// Creates the run and enqueues one job per test case plus a finalize job.
    pub async fn dispatch_run(
        &self,
        cfg: &TestConfiguration,
        queue: &dyn TaskQueue,
    ) -> OrchestrationResult<(TestRun, Vec<JobHandle>)> {
        let (set, metrics) = self.prepare(cfg)?;
        let source = self.rescore_source(cfg)?;

        let mut run = TestRun::new(cfg.clone(), metrics, set.cases.len());
        run.rescored_from = source.map(|s| s.id);
        run.status = RunStatus::Running;
        self.store.save_test_run(&run)?;

        let mut handles = Vec::with_capacity(set.cases.len() + 1);
        for index in 0..set.cases.len() {
            let handle = queue
                .enqueue(Job::execute_case(run.id.clone(), index))
                .await
                .map_err(|e| OrchestrationError::Dispatch(e.to_string()))?;
            handles.push(handle);
        }
        let handle = queue
            .enqueue(Job::finalize(run.id.clone()))
            .await
            .map_err(|e| OrchestrationError::Dispatch(e.to_string()))?;
        handles.push(handle);

        info!(run_id = %run.id, jobs = handles.len(), "test run dispatched");
        Ok((run, handles))
    }

    /// Executes one queued case. Safe under duplicate delivery: a slot that
    /// already holds a result is left untouched.
    pub async fn handle_case_job(&self, run_id: &str, case_index: usize) -> OrchestrationResult<()> {
        let run = self
            .store
            .load_test_run(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            debug!(run_id, case_index, status = run.status.as_str(), "run already finished; ignoring job");
            return Ok(());
        }

        let set = self
            .store
            .load_test_set(&run.configuration.test_set_id)?
            .ok_or_else(|| OrchestrationError::TestSetNotFound(run.configuration.test_set_id.clone()))?;
        let tc = set.cases.get(case_index).ok_or_else(|| {
            OrchestrationError::Dispatch(format!(
                "case index {} out of range for test set {}",
                case_index, set.id
            ))
        })?;

        if self.store.find_test_result(run_id, &tc.id)?.is_some() {
            debug!(run_id, test_case_id = %tc.id, "duplicate delivery; result already stored");
            return Ok(());
        }

        let source = self.rescore_source(&run.configuration)?;
        let case = self.plan_case(&run.configuration, case_index, tc, source.as_ref());
        let exec = self.executor(
            run_id,
            run.metrics.clone(),
            self.config.retry.clone(),
            &CancelSignal::new(),
        );
        exec.execute(case).await;

        // Leave the slot open for redelivery when the write did not land.
        if self.store.find_test_result(run_id, &tc.id)?.is_none() {
            return Err(OrchestrationError::Dispatch(format!(
                "result for test case {} of run {} was not persisted",
                tc.id, run_id
            )));
        }
        Ok(())
    }

    /// Marks a queued run cancelled. Case jobs delivered afterwards are
    /// ignored and the run keeps whatever results it already has.
    pub fn cancel_run(&self, run_id: &str) -> OrchestrationResult<TestRun> {
        let mut run = self
            .store
            .load_test_run(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(Utc::now());
        self.store.save_test_run(&run)?;
        info!(run_id, stored = run.results.len(), total = run.total_cases, "test run cancelled");
        Ok(run)
    }

    /// Computes and persists the aggregate status once every slot is filled.
    /// A run that is already terminal is returned unchanged.
    pub fn finalize_run(&self, run_id: &str) -> OrchestrationResult<TestRun> {
        self.finalize_run_with(run_id, false)
    }

    /// Like [`finalize_run`](Self::finalize_run), but with `force` open slots
    /// count as cases that produced nothing.
    pub fn finalize_run_with(&self, run_id: &str, force: bool) -> OrchestrationResult<TestRun> {
        let mut run = self
            .store
            .load_test_run(run_id)?
            .ok_or_else(|| OrchestrationError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if run.results.len() < run.total_cases {
            if !force {
                debug!(
                    run_id,
                    stored = run.results.len(),
                    total = run.total_cases,
                    "run has open slots"
                );
                return Err(OrchestrationError::RunNotFinished {
                    run_id: run_id.to_string(),
                    status: run.status.as_str().to_string(),
                });
            }
            warn!(
                run_id,
                stored = run.results.len(),
                total = run.total_cases,
                "finalizing run with open slots"
            );
        }

        run.status = RunStatus::aggregate(&run.results, run.total_cases);
        run.finished_at = Some(Utc::now());
        self.store.save_test_run(&run)?;
        info!(run_id, status = run.status.as_str(), "test run finalized");
        Ok(run)
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        match job.kind {
            JobKind::ExecuteTestCase => {
                let index = job
                    .case_index
                    .ok_or_else(|| anyhow::anyhow!("job {} has no case index", job.id))?;
                self.handle_case_job(&job.run_id, index).await?;
            }
            JobKind::FinalizeRun => {
                // Last delivery: stop waiting for case jobs that never landed.
                let force = job.deliveries >= self.config.max_deliveries;
                self.finalize_run_with(&job.run_id, force)?;
            }
        }
        Ok(())
    }
}

/// Everything a case task needs, cheap to clone into spawned tasks.
#[derive(Clone)]
struct CaseExecutor {
    evaluator: MetricEvaluator,
    store: Arc<dyn Persistence>,
    retry: RetryPolicy,
    metrics: Arc<Vec<MetricSpec>>,
    ctx: AcquireContext,
}

impl CaseExecutor {
    /// Runs the case and appends its result. `None` when the case was
    /// discarded by cancellation. A result that could not be stored comes
    /// back failed with `error_kind = "storage"`.
    async fn execute(&self, case: PlannedCase) -> Option<TestResult> {
        let span = info_span!(
            "test_case",
            run_id = %self.ctx.run_id,
            test_case_id = %case.test_case.id,
            provider = case.provider.kind().as_str()
        );
        self.execute_inner(case).instrument(span).await
    }

    async fn execute_inner(&self, case: PlannedCase) -> Option<TestResult> {
        let runner = Runner::for_case(&case.test_case, self.retry.clone());
        let outcome = AssertUnwindSafe(runner.run(
            &case.test_case,
            case.index,
            case.provider.as_ref(),
            &self.evaluator,
            &self.metrics,
            &self.ctx,
        ))
        .catch_unwind()
        .await;

        let mut result = match outcome {
            Ok(RunnerOutcome::Done(r)) => *r,
            Ok(RunnerOutcome::Discarded) => return None,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(error = %message, "test case panicked");
                panicked_result(&self.ctx.run_id, &case, message)
            }
        };
        result.rescored_from = case.rescored_from;

        let stored = match self.store.save_test_result(&result) {
            Ok(SaveOutcome::Inserted) => return Some(result),
            Ok(SaveOutcome::AlreadyExists) => {
                debug!("slot already filled; keeping stored result");
                self.store
                    .find_test_result(&result.run_id, result.test_case_id())
            }
            Err(e) => Err(e),
        };
        match stored {
            Ok(Some(existing)) => Some(existing),
            Ok(None) => Some(storage_failed(result, "slot is filled but holds no result")),
            Err(e) => {
                error!(error = %e, "failed to persist test result");
                Some(storage_failed(result, e))
            }
        }
    }
}

fn storage_failed(mut result: TestResult, err: impl std::fmt::Display) -> TestResult {
    result.status = TestResultStatus::Failed;
    result.output = None;
    result.metrics.clear();
    result.error = Some(format!("failed to persist test result: {}", err));
    result.error_kind = Some("storage".to_string());
    result
}

fn panicked_result(run_id: &str, case: &PlannedCase, message: String) -> TestResult {
    let now = Utc::now();
    TestResult {
        id: uuid::Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        case_index: case.index,
        test_case: case.test_case.clone(),
        status: TestResultStatus::Failed,
        provider: case.provider.kind().as_str().to_string(),
        output: None,
        metrics: Vec::new(),
        attempts: Vec::new(),
        retries: 0,
        error: Some(format!("test case panicked: {}", message)),
        error_kind: Some("panicked".to_string()),
        rescored_from: None,
        started_at: now,
        finished_at: now,
    }
}

fn report(progress: Option<&ProgressSink>, done: usize, total: usize) {
    if let Some(sink) = progress {
        sink(ProgressEvent { done, total });
    }
}

async fn run_sequential(
    exec: &CaseExecutor,
    planned: Vec<PlannedCase>,
    cancel: &CancelSignal,
    progress: Option<&ProgressSink>,
) -> Vec<TestResult> {
    let total = planned.len();
    let mut results = Vec::with_capacity(total);
    for case in planned {
        if cancel.is_cancelled() {
            info!(remaining = total - results.len(), "cancelled; not dispatching remaining cases");
            break;
        }
        if let Some(result) = exec.execute(case).await {
            results.push(result);
            report(progress, results.len(), total);
        }
    }
    results
}

async fn run_parallel(
    exec: &CaseExecutor,
    planned: Vec<PlannedCase>,
    limit: usize,
    cancel: &CancelSignal,
    progress: Option<&ProgressSink>,
) -> Vec<TestResult> {
    let total = planned.len();
    let sem = Arc::new(Semaphore::new(limit));
    let mut join_set = JoinSet::new();

    for case in planned {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cancelled; not dispatching remaining cases");
                break;
            }
            p = sem.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "concurrency limiter closed; not dispatching remaining cases");
                    break;
                }
            },
        };
        let exec = exec.clone();
        join_set.spawn(async move {
            let _permit = permit;
            exec.execute(case).await
        });
    }

    // Every task runs to its barrier; one case going wrong never drops the
    // results of the others.
    let mut results = Vec::with_capacity(total);
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Some(result)) => {
                results.push(result);
                report(progress, results.len(), total);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "test case task did not complete"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_api::{Score, Scorer, ScorerRegistry};
    use crate::model::{Output, TestSet};
    use crate::providers::fake::FakeTarget;
    use crate::storage::Store;

    struct Length;

    #[async_trait]
    impl Scorer for Length {
        fn name(&self) -> &'static str {
            "length"
        }
        async fn score(&self, o: &Output, _p: &serde_json::Value) -> anyhow::Result<Score> {
            let len = o.final_response().map_or(0, str::len);
            Ok(Score::pass(len as f64))
        }
    }

    fn orchestrator(cases: usize) -> Orchestrator {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        store
            .save_test_set(&TestSet {
                id: "set".into(),
                name: "set".into(),
                cases: (0..cases)
                    .map(|i| TestCase::single_turn(format!("t{}", i), format!("prompt {}", i)))
                    .collect(),
                metrics: vec![MetricSpec::single_turn("length", serde_json::json!({}))],
            })
            .unwrap();
        let providers =
            Providers::new(Arc::new(store)).with_target("http://t", Arc::new(FakeTarget::new("ok")));
        let evaluator = MetricEvaluator::new(Arc::new(ScorerRegistry::new().with(Arc::new(Length))));
        Orchestrator::new(providers, evaluator, EngineConfig::default())
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let o = orchestrator(1);
        let cfg = TestConfiguration::live("cfg", "set", "http://t")
            .with_execution(ExecutionMode::Parallel { concurrency: 0 });
        let err = o.execute(&cfg).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn unknown_test_set_is_reported() {
        let o = orchestrator(1);
        let err = o
            .execute(&TestConfiguration::live("cfg", "nope", "http://t"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::TestSetNotFound(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn progress_reports_every_case() {
        let o = orchestrator(4);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressSink = Arc::new(move |e: ProgressEvent| {
            sink_seen.lock().unwrap().push(e);
        });
        let cfg = TestConfiguration::live("cfg", "set", "http://t")
            .with_execution(ExecutionMode::Parallel { concurrency: 2 });

        let run = o.execute_with(&cfg, &CancelSignal::new(), Some(sink)).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last().copied(), Some(ProgressEvent { done: 4, total: 4 }));
    }

    #[tokio::test]
    async fn rescore_source_must_be_finished() {
        let o = orchestrator(1);
        let cfg = TestConfiguration::live("cfg", "set", "http://t").with_source(OutputSource::Rescore {
            source_run_id: "missing".into(),
        });
        let err = o.execute(&cfg).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn finalize_requires_every_slot() {
        let o = orchestrator(2);
        let mut run = TestRun::new(TestConfiguration::live("cfg", "set", "http://t"), vec![], 2);
        run.status = RunStatus::Running;
        o.store().save_test_run(&run).unwrap();

        let err = o.finalize_run(&run.id).unwrap_err();
        assert!(matches!(err, OrchestrationError::RunNotFinished { .. }));

        o.handle_case_job(&run.id, 0).await.unwrap();
        o.handle_case_job(&run.id, 1).await.unwrap();
        let finished = o.finalize_run(&run.id).unwrap();
        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(finished.results.len(), 2);
    }
}
