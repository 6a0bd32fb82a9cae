use anyhow::Context;
use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use regex::Regex;
use serde_json::Value;

use crate::params;

/// Final response must match `pattern`.
pub struct RegexMatchScorer;

#[async_trait]
impl Scorer for RegexMatchScorer {
    fn name(&self) -> &'static str {
        "regex_match"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let pattern = params::string(params, "pattern")?;
        let re = Regex::new(&pattern).with_context(|| format!("invalid regex '{}'", pattern))?;
        let text = output.final_response().unwrap_or_default();

        if re.is_match(text) {
            Ok(Score::pass(1.0))
        } else {
            Ok(Score::fail(0.0, &format!("no match for /{}/", pattern)))
        }
    }
}
