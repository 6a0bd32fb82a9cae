//! One test case end to end: acquire, evaluate, assemble.
//!
//! A runner owns no collaborators. The provider, evaluator and metric set
//! are passed per call, so rescore and trace replay reuse the exact same
//! evaluation path as live runs.

use super::retry::{acquire_with_retry, RetryPolicy};
use crate::errors::AcquisitionError;
use crate::evaluator::MetricEvaluator;
use crate::model::{MetricSpec, TestCase, TestResult, TestResultStatus, TurnMode};
use crate::providers::{AcquireContext, OutputProvider};
use chrono::Utc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    Acquiring,
    Evaluating,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerOutcome {
    Done(Box<TestResult>),
    /// Cancelled before dispatch or hard-cancelled mid-flight; nothing to persist.
    Discarded,
}

impl RunnerOutcome {
    pub fn into_result(self) -> Option<TestResult> {
        match self {
            RunnerOutcome::Done(r) => Some(*r),
            RunnerOutcome::Discarded => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    mode: TurnMode,
    retry: RetryPolicy,
}

impl Runner {
    pub fn single_turn(retry: RetryPolicy) -> Self {
        Self {
            mode: TurnMode::SingleTurn,
            retry,
        }
    }

    pub fn multi_turn(retry: RetryPolicy) -> Self {
        Self {
            mode: TurnMode::MultiTurn,
            retry,
        }
    }

    pub fn for_case(tc: &TestCase, retry: RetryPolicy) -> Self {
        match tc.mode {
            TurnMode::SingleTurn => Self::single_turn(retry),
            TurnMode::MultiTurn => Self::multi_turn(retry),
        }
    }

    pub fn mode(&self) -> TurnMode {
        self.mode
    }

    /// Metrics of this runner's scope with the case's expected params merged in.
    pub fn applicable_metrics(&self, tc: &TestCase, metrics: &[MetricSpec]) -> Vec<MetricSpec> {
        metrics
            .iter()
            .filter(|m| m.scope == self.mode)
            .map(|m| m.with_overlay(tc.expected.get(&m.name)))
            .collect()
    }

    pub async fn run(
        &self,
        tc: &TestCase,
        case_index: usize,
        provider: &dyn OutputProvider,
        evaluator: &MetricEvaluator,
        metrics: &[MetricSpec],
        ctx: &AcquireContext,
    ) -> RunnerOutcome {
        let started_at = Utc::now();
        let mut state = RunnerState::Pending;

        transition(&mut state, RunnerState::Acquiring, tc);
        let (acquired, attempts) = acquire_with_retry(provider, tc, ctx, &self.retry).await;
        let retries = u32::try_from(attempts.len().saturating_sub(1)).unwrap_or(u32::MAX);

        let mut result = TestResult {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: ctx.run_id.clone(),
            case_index,
            test_case: tc.clone(),
            status: TestResultStatus::Failed,
            provider: provider.kind().as_str().to_string(),
            output: None,
            metrics: Vec::new(),
            attempts,
            retries,
            error: None,
            error_kind: None,
            rescored_from: None,
            started_at,
            finished_at: started_at,
        };

        let output = match acquired {
            Ok(output) => output,
            Err(AcquisitionError::Cancelled) if ctx.cancel.is_hard() || result.attempts.is_empty() => {
                debug!(test_case_id = %tc.id, "discarding cancelled test case");
                return RunnerOutcome::Discarded;
            }
            Err(e) => {
                result.error_kind = Some(e.kind().to_string());
                result.error = Some(e.to_string());
                result.finished_at = Utc::now();
                transition(&mut state, RunnerState::Done, tc);
                return RunnerOutcome::Done(Box::new(result));
            }
        };

        transition(&mut state, RunnerState::Evaluating, tc);
        let applicable = self.applicable_metrics(tc, metrics);
        let scored = match self.mode {
            TurnMode::SingleTurn => {
                evaluator
                    .evaluate_single_turn_metrics(&output, &applicable)
                    .await
            }
            TurnMode::MultiTurn => {
                evaluator
                    .evaluate_multi_turn_metrics(&output, &applicable)
                    .await
            }
        };

        if ctx.cancel.is_hard() {
            debug!(test_case_id = %tc.id, "hard cancel during evaluation; discarding");
            return RunnerOutcome::Discarded;
        }

        result.status = if scored.iter().any(|m| m.is_error()) {
            TestResultStatus::Partial
        } else {
            TestResultStatus::Completed
        };
        result.output = Some(output);
        result.metrics = scored;
        result.finished_at = Utc::now();
        transition(&mut state, RunnerState::Done, tc);
        RunnerOutcome::Done(Box::new(result))
    }
}

fn transition(state: &mut RunnerState, next: RunnerState, tc: &TestCase) {
    debug!(test_case_id = %tc.id, from = ?*state, to = ?next, "runner state");
    *state = next;
}
