use std::sync::Arc;

use evalrun_core::metrics_api::{Scorer, ScorerRegistry};

mod conversation_contains;
mod exact_match;
mod must_contain;
mod must_not_contain;
mod params;
mod regex_match;
mod tool_called;
mod turn_budget;

pub use conversation_contains::ConversationContainsScorer;
pub use exact_match::ExactMatchScorer;
pub use must_contain::MustContainScorer;
pub use must_not_contain::MustNotContainScorer;
pub use regex_match::RegexMatchScorer;
pub use tool_called::ToolCalledScorer;
pub use turn_budget::TurnBudgetScorer;

pub fn default_scorers() -> Vec<Arc<dyn Scorer>> {
    vec![
        Arc::new(MustContainScorer),
        Arc::new(MustNotContainScorer),
        Arc::new(RegexMatchScorer),
        Arc::new(ExactMatchScorer),
        Arc::new(ToolCalledScorer),
        Arc::new(TurnBudgetScorer),
        Arc::new(ConversationContainsScorer),
    ]
}

/// Registry holding every built-in scorer.
pub fn default_registry() -> ScorerRegistry {
    default_scorers()
        .into_iter()
        .fold(ScorerRegistry::new(), ScorerRegistry::with)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_all_builtins() {
        let reg = default_registry();
        assert_eq!(
            reg.names(),
            vec![
                "conversation_contains",
                "exact_match",
                "must_contain",
                "must_not_contain",
                "regex_match",
                "tool_called",
                "turn_budget",
            ]
        );
    }
}
