use async_trait::async_trait;
use evalrun_core::metrics_api::{Score, Scorer};
use evalrun_core::model::{Output, Role};
use serde_json::Value;

use crate::params;

/// Some single assistant turn contains every phrase.
///
/// The value is the best per-turn share of phrases found.
pub struct ConversationContainsScorer;

#[async_trait]
impl Scorer for ConversationContainsScorer {
    fn name(&self) -> &'static str {
        "conversation_contains"
    }

    async fn score(&self, output: &Output, params: &Value) -> anyhow::Result<Score> {
        let phrases = params::string_list(params, &["phrases", "phrase"])?;
        let case_sensitive = params::flag(params, "case_sensitive", false)?;
        if phrases.is_empty() {
            return Ok(Score::pass(1.0));
        }
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| params::fold(p, case_sensitive))
            .collect();

        let mut best = 0usize;
        let mut best_turn = None;
        for (i, turn) in output.turns.iter().enumerate() {
            if turn.role != Role::Assistant {
                continue;
            }
            let content = params::fold(&turn.content, case_sensitive);
            let found = phrases.iter().filter(|p| content.contains(p.as_str())).count();
            if found > best {
                best = found;
                best_turn = Some(i);
            }
        }

        let value = best as f64 / phrases.len() as f64;
        let details = serde_json::json!({ "best_turn": best_turn, "found": best, "phrases": phrases.len() });
        if best == phrases.len() {
            Ok(Score::pass(value).with_details(details))
        } else {
            Ok(Score::fail(value, "no assistant turn contains every phrase").with_details(details))
        }
    }
}
