use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use serde_json::Value;

use crate::params;

/// None of the listed substrings may occur in the final response.
pub struct MustNotContainScorer;

#[async_trait]
impl Scorer for MustNotContainScorer {
    fn name(&self) -> &'static str {
        "must_not_contain"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let banned = params::string_list(params, &["values", "value", "must_not_contain"])?;
        let case_sensitive = params::flag(params, "case_sensitive", true)?;
        let text = params::fold(output.final_response().unwrap_or_default(), case_sensitive);

        let hits: Vec<&String> = banned
            .iter()
            .filter(|b| text.contains(&params::fold(b, case_sensitive)))
            .collect();

        if hits.is_empty() {
            Ok(Score::pass(1.0))
        } else {
            Ok(Score::fail(0.0, "forbidden substrings present")
                .with_details(serde_json::json!({ "found": hits })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrun_core::model::Turn;
    use serde_json::json;

    fn out(text: &str) -> Output {
        Output::single_turn("q", Turn::assistant(text), "single_turn")
    }

    #[tokio::test]
    async fn flags_forbidden_text() {
        let s = MustNotContainScorer
            .score(&out("my password is hunter2"), &json!({"values": ["password", "ssn"]}))
            .await
            .unwrap();
        assert!(!s.passed);
        assert_eq!(s.details["found"], json!(["password"]));
    }

    #[tokio::test]
    async fn clean_text_passes() {
        let s = MustNotContainScorer
            .score(&out("hello"), &json!({"value": "password"}))
            .await
            .unwrap();
        assert!(s.passed);
    }
}
