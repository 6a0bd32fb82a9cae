use crate::model::Output;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Raw verdict of a scorer, before thresholds are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
    pub value: f64,
    pub passed: bool,
    pub details: serde_json::Value,
}

impl Score {
    pub fn pass(value: f64) -> Self {
        Self {
            value,
            passed: true,
            details: serde_json::json!({}),
        }
    }

    pub fn fail(value: f64, msg: &str) -> Self {
        Self {
            value,
            passed: false,
            details: serde_json::json!({ "message": msg }),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Pluggable metric implementation. Scorers are stateless and may be
/// invoked concurrently.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, output: &Output, params: &serde_json::Value) -> anyhow::Result<Score>;
}

/// Metric name -> scorer. Built once and shared by `Arc`.
#[derive(Clone, Default)]
pub struct ScorerRegistry {
    scorers: HashMap<String, Arc<dyn Scorer>>,
}

impl ScorerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `scorer` under its own name, replacing any previous entry.
    pub fn register(&mut self, scorer: Arc<dyn Scorer>) {
        self.scorers.insert(scorer.name().to_string(), scorer);
    }

    pub fn with(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.register(scorer);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scorer>> {
        self.scorers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scorers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }
}
