#![allow(dead_code)]

use async_trait::async_trait;
use evalrun_core::config::EngineConfig;
use evalrun_core::engine::RetryPolicy;
use evalrun_core::evaluator::MetricEvaluator;
use evalrun_core::metrics_api::{Score, Scorer, ScorerRegistry};
use evalrun_core::model::{MetricSpec, Output, TestCase, TestResult, TestRun, TestSet};
use evalrun_core::providers::{Providers, Target};
use evalrun_core::storage::{Persistence, SaveOutcome, Store};
use evalrun_core::trace::Trace;
use evalrun_core::Orchestrator;
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Passes when the final response contains `value`; scores response length.
pub struct ContainsScorer;

#[async_trait]
impl Scorer for ContainsScorer {
    fn name(&self) -> &'static str {
        "contains"
    }

    async fn score(&self, output: &Output, params: &serde_json::Value) -> anyhow::Result<Score> {
        let needle = params
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'value'"))?;
        let text = output.final_response().unwrap_or_default();
        let value = text.len() as f64;
        Ok(if text.contains(needle) {
            Score::pass(value)
        } else {
            Score::fail(value, "not found")
        })
    }
}

/// Always errors.
pub struct BrokenScorer;

#[async_trait]
impl Scorer for BrokenScorer {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn score(&self, _output: &Output, _params: &serde_json::Value) -> anyhow::Result<Score> {
        anyhow::bail!("scorer backend unavailable")
    }
}

pub fn evaluator() -> MetricEvaluator {
    let reg = ScorerRegistry::new()
        .with(Arc::new(ContainsScorer))
        .with(Arc::new(BrokenScorer));
    MetricEvaluator::new(Arc::new(reg))
}

pub fn store() -> Arc<dyn Persistence> {
    let s = Store::memory().unwrap();
    s.init_schema().unwrap();
    Arc::new(s)
}

/// Store whose result writes fail for one test case id. Run writes still go
/// through, so a run can record what it could not store.
pub struct FlakyStore {
    inner: Store,
    fail_case: String,
}

impl FlakyStore {
    pub fn failing_for(test_case_id: &str) -> Arc<Self> {
        let inner = Store::memory().unwrap();
        inner.init_schema().unwrap();
        Arc::new(Self {
            inner,
            fail_case: test_case_id.to_string(),
        })
    }
}

impl Persistence for FlakyStore {
    fn save_test_set(&self, set: &TestSet) -> anyhow::Result<()> {
        self.inner.save_test_set(set)
    }

    fn load_test_set(&self, id: &str) -> anyhow::Result<Option<TestSet>> {
        self.inner.load_test_set(id)
    }

    fn save_test_result(&self, result: &TestResult) -> anyhow::Result<SaveOutcome> {
        if result.test_case_id() == self.fail_case {
            anyhow::bail!("disk full");
        }
        self.inner.save_test_result(result)
    }

    fn load_test_result(&self, id: &str) -> anyhow::Result<Option<TestResult>> {
        self.inner.load_test_result(id)
    }

    fn find_test_result(
        &self,
        run_id: &str,
        test_case_id: &str,
    ) -> anyhow::Result<Option<TestResult>> {
        self.inner.find_test_result(run_id, test_case_id)
    }

    fn load_test_results(&self, run_id: &str) -> anyhow::Result<Vec<TestResult>> {
        self.inner.load_test_results(run_id)
    }

    fn save_test_run(&self, run: &TestRun) -> anyhow::Result<()> {
        self.inner.save_test_run(run)
    }

    fn load_test_run(&self, id: &str) -> anyhow::Result<Option<TestRun>> {
        self.inner.load_test_run(id)
    }

    fn save_trace(&self, trace: &Trace) -> anyhow::Result<()> {
        self.inner.save_trace(trace)
    }

    fn load_trace(&self, id: &str) -> anyhow::Result<Option<Trace>> {
        self.inner.load_trace(id)
    }
}

pub fn test_set(id: &str, cases: Vec<TestCase>) -> TestSet {
    TestSet {
        id: id.into(),
        name: format!("{} cases", id),
        cases,
        metrics: vec![MetricSpec::single_turn(
            "contains",
            serde_json::json!({"value": "prompt"}),
        )],
    }
}

pub fn single_turn_cases(n: usize) -> Vec<TestCase> {
    (0..n)
        .map(|i| TestCase::single_turn(format!("case-{}", i), format!("prompt {}", i)))
        .collect()
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    }
}

/// Endpoint every test configuration binds to.
pub const ENDPOINT: &str = "http://target";

pub fn orchestrator(store: Arc<dyn Persistence>, target: Arc<dyn Target>) -> Orchestrator {
    Orchestrator::new(
        Providers::new(store).with_target(ENDPOINT, target),
        evaluator(),
        fast_config(),
    )
}
