//! Persistence boundary consumed by the pipeline.
//!
//! All operations are single-entity transactional. Result writes are
//! append-only per `(run_id, test_case_id)` slot, which is what makes
//! duplicate job delivery harmless.

pub mod schema;
pub mod store;

pub use store::Store;

use crate::model::{TestResult, TestRun, TestSet};
use crate::trace::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// The slot was already filled; nothing was written.
    AlreadyExists,
}

pub trait Persistence: Send + Sync {
    fn save_test_set(&self, set: &TestSet) -> anyhow::Result<()>;
    fn load_test_set(&self, id: &str) -> anyhow::Result<Option<TestSet>>;

    fn save_test_result(&self, result: &TestResult) -> anyhow::Result<SaveOutcome>;
    fn load_test_result(&self, id: &str) -> anyhow::Result<Option<TestResult>>;
    fn find_test_result(
        &self,
        run_id: &str,
        test_case_id: &str,
    ) -> anyhow::Result<Option<TestResult>>;
    /// Results of a run ordered by case index.
    fn load_test_results(&self, run_id: &str) -> anyhow::Result<Vec<TestResult>>;

    /// Upserts the run header and appends any results not yet stored.
    /// A run already in a terminal status keeps that status.
    fn save_test_run(&self, run: &TestRun) -> anyhow::Result<()>;
    fn load_test_run(&self, id: &str) -> anyhow::Result<Option<TestRun>>;

    fn save_trace(&self, trace: &Trace) -> anyhow::Result<()>;
    fn load_trace(&self, id: &str) -> anyhow::Result<Option<Trace>>;
}
