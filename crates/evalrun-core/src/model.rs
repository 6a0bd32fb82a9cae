use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Whether a test case is one request/response pair or a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    #[default]
    SingleTurn,
    MultiTurn,
}

impl TurnMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnMode::SingleTurn => "single_turn",
            TurnMode::MultiTurn => "multi_turn",
        }
    }
}

/// Scope a metric applies to. Mirrors [`TurnMode`] one-to-one.
pub type MetricScope = TurnMode;

/// Static description of a metric attached to a test set or configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric identifier; also the key of the scorer plugin.
    pub name: String,
    #[serde(default)]
    pub scope: MetricScope,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
    /// When set, `value >= threshold` decides the verdict instead of the scorer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl MetricSpec {
    pub fn single_turn(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            scope: TurnMode::SingleTurn,
            params,
            threshold: None,
        }
    }

    pub fn multi_turn(name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            scope: TurnMode::MultiTurn,
            params,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Declared params with a per-test-case overlay merged on top (object keys only).
    pub fn with_overlay(&self, overlay: Option<&serde_json::Value>) -> MetricSpec {
        let mut out = self.clone();
        if let Some(serde_json::Value::Object(extra)) = overlay {
            if !out.params.is_object() {
                out.params = empty_object();
            }
            if let Some(base) = out.params.as_object_mut() {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// One unit drawn from a test set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub mode: TurnMode,
    /// Metric name -> params overlay describing the expected behavior.
    #[serde(default)]
    pub expected: BTreeMap<String, serde_json::Value>,
    /// Stored telemetry trace this case can be reconstructed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TestCase {
    pub fn single_turn(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            mode: TurnMode::SingleTurn,
            expected: BTreeMap::new(),
            trace_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn multi_turn(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            mode: TurnMode::MultiTurn,
            ..Self::single_turn(id, prompt)
        }
    }

    pub fn expect(mut self, metric: impl Into<String>, params: serde_json::Value) -> Self {
        self.expected.insert(metric.into(), params);
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSet {
    pub id: String,
    pub name: String,
    pub cases: Vec<TestCase>,
    /// Metric set used unless the configuration overrides it.
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

impl TestSet {
    /// Case ids key the result slots of a run, so they must be unique.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for tc in &self.cases {
            if !seen.insert(tc.id.as_str()) {
                return Err(format!(
                    "test set {} has duplicate test case id '{}'",
                    self.id, tc.id
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// The acquired artifact that metrics score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub mode: TurnMode,
    /// Prompt the output answers (single-turn) or the scenario seed (multi-turn).
    pub input: String,
    pub turns: Vec<Turn>,
    /// Provider name that produced the output ("single_turn", "trace", ...).
    pub source: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl Output {
    pub fn single_turn(input: impl Into<String>, turn: Turn, source: &str) -> Self {
        Self {
            mode: TurnMode::SingleTurn,
            input: input.into(),
            turns: vec![turn],
            source: source.to_string(),
            meta: serde_json::json!({}),
        }
    }

    pub fn multi_turn(input: impl Into<String>, turns: Vec<Turn>, source: &str) -> Self {
        Self {
            mode: TurnMode::MultiTurn,
            input: input.into(),
            turns,
            source: source.to_string(),
            meta: serde_json::json!({}),
        }
    }

    /// Content of the last assistant turn, if any.
    pub fn final_response(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Assistant)
            .map(|t| t.content.as_str())
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallRecord> {
        self.turns.iter().flat_map(|t| t.tool_calls.iter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Scored,
    Errored,
    Skipped,
}

/// One per (TestCase, metric) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub metric: String,
    pub scope: MetricScope,
    pub status: MetricStatus,
    pub value: Option<f64>,
    pub passed: Option<bool>,
    pub error: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl MetricResult {
    pub fn scored(spec: &MetricSpec, value: f64, passed: bool, details: serde_json::Value) -> Self {
        Self {
            metric: spec.name.clone(),
            scope: spec.scope,
            status: MetricStatus::Scored,
            value: Some(value),
            passed: Some(passed),
            error: None,
            details,
        }
    }

    pub fn errored(spec: &MetricSpec, error: impl Into<String>) -> Self {
        Self {
            metric: spec.name.clone(),
            scope: spec.scope,
            status: MetricStatus::Errored,
            value: None,
            passed: None,
            error: Some(error.into()),
            details: serde_json::json!({}),
        }
    }

    pub fn skipped(spec: &MetricSpec, reason: impl Into<String>) -> Self {
        Self {
            metric: spec.name.clone(),
            scope: spec.scope,
            status: MetricStatus::Skipped,
            value: None,
            passed: None,
            error: None,
            details: serde_json::json!({ "reason": reason.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == MetricStatus::Errored
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResultStatus {
    Completed,
    Partial,
    Failed,
}

impl TestResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestResultStatus::Completed => "completed",
            TestResultStatus::Partial => "partial",
            TestResultStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_no: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// One test case's outcome. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub run_id: String,
    /// Position of the case in its test set; the slot key for reassembly.
    pub case_index: usize,
    /// Snapshot of the case as it was executed.
    pub test_case: TestCase,
    pub status: TestResultStatus,
    pub provider: String,
    pub output: Option<Output>,
    pub metrics: Vec<MetricResult>,
    pub attempts: Vec<AttemptRecord>,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Stored result whose output was re-scored to produce this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescored_from: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    pub fn test_case_id(&self) -> &str {
        &self.test_case.id
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Aggregate status of a finished run over `expected` dispatched cases.
    ///
    /// `Completed` needs one completed result per case; `Failed` means no
    /// case produced a scorable output; anything in between is `Partial`.
    pub fn aggregate(results: &[TestResult], expected: usize) -> RunStatus {
        if expected == 0 {
            return RunStatus::Completed;
        }
        if results.iter().all(|r| !r.has_output()) {
            return RunStatus::Failed;
        }
        let all_completed = results
            .iter()
            .all(|r| r.status == TestResultStatus::Completed);
        if results.len() == expected && all_completed {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }
}

/// Where outputs come from for a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputSource {
    Live,
    /// Replay stored outputs of a finished run.
    Rescore { source_run_id: String },
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel { concurrency: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBinding {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Immutable binding of a test set, a target, and execution parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub id: String,
    pub test_set_id: String,
    pub target: TargetBinding,
    pub output_source: OutputSource,
    pub execution: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_overrides: Option<Vec<MetricSpec>>,
}

impl TestConfiguration {
    pub fn live(
        id: impl Into<String>,
        test_set_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            test_set_id: test_set_id.into(),
            target: TargetBinding {
                endpoint: endpoint.into(),
                name: None,
            },
            output_source: OutputSource::Live,
            execution: ExecutionMode::Sequential,
            metric_overrides: None,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_source(mut self, source: OutputSource) -> Self {
        self.output_source = source;
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<MetricSpec>) -> Self {
        self.metric_overrides = Some(metrics);
        self
    }

    /// Metric set for a run over `test_set`.
    pub fn effective_metrics(&self, test_set: &TestSet) -> Vec<MetricSpec> {
        self.metric_overrides
            .clone()
            .unwrap_or_else(|| test_set.metrics.clone())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("configuration id must not be empty".into());
        }
        if self.test_set_id.trim().is_empty() {
            return Err("test_set_id must not be empty".into());
        }
        if let ExecutionMode::Parallel { concurrency: 0 } = self.execution {
            return Err("parallel concurrency must be at least 1".into());
        }
        if let OutputSource::Rescore { source_run_id } = &self.output_source {
            if source_run_id.trim().is_empty() {
                return Err("rescore source_run_id must not be empty".into());
            }
        }
        Ok(())
    }
}

/// A collection of TestResults produced by one execution of a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub configuration: TestConfiguration,
    pub metrics: Vec<MetricSpec>,
    pub status: RunStatus,
    /// Number of test cases the run covers.
    pub total_cases: usize,
    pub results: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescored_from: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TestRun {
    pub fn new(configuration: TestConfiguration, metrics: Vec<MetricSpec>, total: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            configuration,
            metrics,
            status: RunStatus::Pending,
            total_cases: total,
            results: Vec::new(),
            rescored_from: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        let mut s = RunSummary {
            total: self.total_cases,
            ..RunSummary::default()
        };
        let mut scored = 0usize;
        let mut passed = 0usize;
        for r in &self.results {
            match r.status {
                TestResultStatus::Completed => s.completed += 1,
                TestResultStatus::Partial => s.partial += 1,
                TestResultStatus::Failed => s.failed += 1,
            }
            for m in &r.metrics {
                match m.status {
                    MetricStatus::Scored => {
                        scored += 1;
                        if m.passed == Some(true) {
                            passed += 1;
                        }
                    }
                    MetricStatus::Errored => s.metric_errors += 1,
                    MetricStatus::Skipped => {}
                }
            }
        }
        s.pass_rate = if scored == 0 {
            None
        } else {
            Some(passed as f64 / scored as f64)
        };
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub metric_errors: usize,
    /// Share of scored metrics that passed; `None` when nothing was scored.
    pub pass_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: TestResultStatus, with_output: bool) -> TestResult {
        TestResult {
            id: "r".into(),
            run_id: "run".into(),
            case_index: 0,
            test_case: TestCase::single_turn("t", "p"),
            status,
            provider: "single_turn".into(),
            output: with_output
                .then(|| Output::single_turn("p", Turn::assistant("ok"), "single_turn")),
            metrics: vec![],
            attempts: vec![],
            retries: 0,
            error: None,
            error_kind: None,
            rescored_from: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn aggregate_all_completed_is_completed() {
        let rs = vec![
            result(TestResultStatus::Completed, true),
            result(TestResultStatus::Completed, true),
        ];
        assert_eq!(RunStatus::aggregate(&rs, 2), RunStatus::Completed);
    }

    #[test]
    fn aggregate_missing_slot_is_partial() {
        let rs = vec![result(TestResultStatus::Completed, true)];
        assert_eq!(RunStatus::aggregate(&rs, 2), RunStatus::Partial);
    }

    #[test]
    fn aggregate_mixed_failure_is_partial() {
        let rs = vec![
            result(TestResultStatus::Completed, true),
            result(TestResultStatus::Failed, false),
        ];
        assert_eq!(RunStatus::aggregate(&rs, 2), RunStatus::Partial);
    }

    #[test]
    fn aggregate_nothing_acquired_is_failed() {
        let rs = vec![
            result(TestResultStatus::Failed, false),
            result(TestResultStatus::Failed, false),
        ];
        assert_eq!(RunStatus::aggregate(&rs, 2), RunStatus::Failed);
        assert_eq!(RunStatus::aggregate(&[], 3), RunStatus::Failed);
    }

    #[test]
    fn metric_overlay_merges_case_params() {
        let spec = MetricSpec::single_turn("must_contain", serde_json::json!({"a": 1, "b": 2}));
        let merged = spec.with_overlay(Some(&serde_json::json!({"b": 3, "c": 4})));
        assert_eq!(merged.params, serde_json::json!({"a": 1, "b": 3, "c": 4}));
        assert_eq!(spec.with_overlay(None).params, spec.params);
    }

    #[test]
    fn final_response_skips_trailing_user_turns() {
        let out = Output::multi_turn(
            "hi",
            vec![Turn::user("hi"), Turn::assistant("hello"), Turn::user("bye")],
            "multi_turn",
        );
        assert_eq!(out.final_response(), Some("hello"));
    }

    #[test]
    fn configuration_validation_rejects_zero_concurrency() {
        let cfg = TestConfiguration::live("c", "s", "http://target")
            .with_execution(ExecutionMode::Parallel { concurrency: 0 });
        assert!(cfg.validate().is_err());
        let ok = cfg.with_execution(ExecutionMode::Sequential);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_set_rejects_duplicate_case_ids() {
        let mut set = TestSet {
            id: "s".into(),
            name: "s".into(),
            cases: vec![
                TestCase::single_turn("dup", "prompt a"),
                TestCase::single_turn("dup", "prompt b"),
            ],
            metrics: vec![],
        };
        let err = set.validate().unwrap_err();
        assert!(err.contains("'dup'"));

        set.cases[1].id = "other".into();
        assert!(set.validate().is_ok());
    }
}
