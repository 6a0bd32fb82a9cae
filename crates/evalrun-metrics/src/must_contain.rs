use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use serde_json::Value;

use crate::params;

/// Every listed substring must occur in the final response.
///
/// Params: `values` (string or list), `case_sensitive` (default true).
pub struct MustContainScorer;

#[async_trait]
impl Scorer for MustContainScorer {
    fn name(&self) -> &'static str {
        "must_contain"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let needles = params::string_list(params, &["values", "value", "must_contain"])?;
        let case_sensitive = params::flag(params, "case_sensitive", true)?;
        let text = params::fold(output.final_response().unwrap_or_default(), case_sensitive);

        let missing: Vec<&String> = needles
            .iter()
            .filter(|n| !text.contains(&params::fold(n, case_sensitive)))
            .collect();

        if needles.is_empty() {
            return Ok(Score::pass(1.0));
        }
        let found = needles.len() - missing.len();
        let value = found as f64 / needles.len() as f64;
        if missing.is_empty() {
            Ok(Score::pass(value))
        } else {
            Ok(Score::fail(value, "missing substrings")
                .with_details(serde_json::json!({ "missing": missing })))
        }
    }
}
