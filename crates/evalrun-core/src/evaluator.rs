//! Per-metric scoring with failure isolation.
//!
//! Every input metric yields exactly one [`MetricResult`], in input order.
//! A scorer that errors or panics only affects its own entry.

use crate::errors::EvaluationError;
use crate::metrics_api::{Score, ScorerRegistry};
use crate::model::{MetricResult, MetricSpec, Output, TurnMode};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct MetricEvaluator {
    scorers: Arc<ScorerRegistry>,
}

impl MetricEvaluator {
    pub fn new(scorers: Arc<ScorerRegistry>) -> Self {
        Self { scorers }
    }

    pub fn registry(&self) -> &ScorerRegistry {
        &self.scorers
    }

    pub async fn evaluate_single_turn_metrics(
        &self,
        output: &Output,
        metrics: &[MetricSpec],
    ) -> Vec<MetricResult> {
        self.evaluate(TurnMode::SingleTurn, output, metrics).await
    }

    pub async fn evaluate_multi_turn_metrics(
        &self,
        output: &Output,
        metrics: &[MetricSpec],
    ) -> Vec<MetricResult> {
        self.evaluate(TurnMode::MultiTurn, output, metrics).await
    }

    async fn evaluate(
        &self,
        mode: TurnMode,
        output: &Output,
        metrics: &[MetricSpec],
    ) -> Vec<MetricResult> {
        join_all(metrics.iter().map(|spec| self.evaluate_one(mode, output, spec))).await
    }

    async fn evaluate_one(&self, mode: TurnMode, output: &Output, spec: &MetricSpec) -> MetricResult {
        if spec.scope != mode {
            let err = EvaluationError::ScopeMismatch {
                metric: spec.name.clone(),
                scope: spec.scope.as_str().to_string(),
                mode: mode.as_str().to_string(),
            };
            debug!(metric = %spec.name, "{}", err);
            return MetricResult::skipped(spec, err.to_string());
        }

        let Some(scorer) = self.scorers.get(&spec.name) else {
            return MetricResult::errored(spec, EvaluationError::UnknownMetric(spec.name.clone()).to_string());
        };

        let outcome = AssertUnwindSafe(scorer.score(output, &spec.params))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(score)) => return apply_threshold(spec, score),
            Ok(Err(e)) => EvaluationError::ScorerFailed {
                metric: spec.name.clone(),
                message: format!("{:#}", e),
            },
            Err(payload) => EvaluationError::ScorerPanicked {
                metric: spec.name.clone(),
                message: panic_message(payload.as_ref()),
            },
        };
        warn!(metric = %spec.name, error = %err, "metric evaluation failed");
        MetricResult::errored(spec, err.to_string())
    }
}

fn apply_threshold(spec: &MetricSpec, score: Score) -> MetricResult {
    if !score.value.is_finite() {
        return MetricResult::errored(
            spec,
            EvaluationError::ScorerFailed {
                metric: spec.name.clone(),
                message: format!("non-finite score {}", score.value),
            }
            .to_string(),
        );
    }
    let passed = match spec.threshold {
        Some(t) => score.value >= t,
        None => score.passed,
    };
    MetricResult::scored(spec, score.value, passed, score.details)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "scorer panicked".to_string()
    }
}
