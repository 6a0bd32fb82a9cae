use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use serde_json::Value;

use crate::params;

/// Final response equals `expected`. Surrounding whitespace is ignored
/// unless `trim` is false.
pub struct ExactMatchScorer;

#[async_trait]
impl Scorer for ExactMatchScorer {
    fn name(&self) -> &'static str {
        "exact_match"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let expected = params::string(params, "expected")?;
        let trim = params::flag(params, "trim", true)?;
        let case_sensitive = params::flag(params, "case_sensitive", true)?;
        let actual = output.final_response().unwrap_or_default();

        let (a, e) = if trim {
            (actual.trim(), expected.trim())
        } else {
            (actual, expected.as_str())
        };
        if params::fold(a, case_sensitive) == params::fold(e, case_sensitive) {
            Ok(Score::pass(1.0))
        } else {
            Ok(Score::fail(0.0, "response differs from expected")
                .with_details(serde_json::json!({ "expected": e, "actual": a })))
        }
    }
}
