use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::params;

/// Every listed tool must appear in the output's tool-call trace.
pub struct ToolCalledScorer;

#[async_trait]
impl Scorer for ToolCalledScorer {
    fn name(&self) -> &'static str {
        "tool_called"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let wanted = params::string_list(params, &["tools", "tool"])?;
        let called: BTreeSet<&str> = output.tool_calls().map(|c| c.tool_name.as_str()).collect();

        let missing: Vec<&String> = wanted
            .iter()
            .filter(|t| !called.contains(t.as_str()))
            .collect();

        if !missing.is_empty() {
            tracing::debug!(?missing, called = called.len(), "expected tools not called");
        }

        let details = serde_json::json!({ "called": called, "missing": missing });
        if missing.is_empty() {
            Ok(Score::pass(1.0).with_details(details))
        } else {
            Ok(Score::fail(0.0, "expected tool not called").with_details(details))
        }
    }
}
