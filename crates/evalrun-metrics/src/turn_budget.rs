use anyhow::Context;
use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::Output;
use serde_json::Value;

/// Conversation finished within `max_turns` turns (all roles counted).
pub struct TurnBudgetScorer;

#[async_trait]
impl Scorer for TurnBudgetScorer {
    fn name(&self) -> &'static str {
        "turn_budget"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let max_turns = params
            .get("max_turns")
            .and_then(Value::as_u64)
            .context("missing integer parameter 'max_turns'")?;
        let turns = output.turns.len() as u64;
        let details = serde_json::json!({ "turns": turns, "max_turns": max_turns });

        if turns <= max_turns {
            Ok(Score::pass(1.0).with_details(details))
        } else {
            Ok(Score::fail(0.0, "turn budget exceeded").with_details(details))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrun_core::model::Turn;
    use serde_json::json;

    fn conversation(n: usize) -> Output {
        let turns = (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user("u")
                } else {
                    Turn::assistant("a")
                }
            })
            .collect();
        Output::multi_turn("scenario", turns, "multi_turn")
    }

    #[tokio::test]
    async fn within_and_over_budget() {
        let p = json!({"max_turns": 4});
        assert!(TurnBudgetScorer.score(&conversation(4), &p).await.unwrap().passed);
        let over = TurnBudgetScorer.score(&conversation(6), &p).await.unwrap();
        assert!(!over.passed);
        assert_eq!(over.details["turns"], json!(6));
    }

    #[tokio::test]
    async fn max_turns_is_required() {
        assert!(TurnBudgetScorer
            .score(&conversation(2), &json!({"max_turns": "four"}))
            .await
            .is_err());
    }
}
