pub mod config;
pub mod engine;
pub mod errors;
pub mod evaluator;
pub mod jobs;
pub mod metrics_api;
pub mod model;
pub mod providers;
pub mod storage;
pub mod trace;

pub use config::EngineConfig;
pub use engine::{CancelSignal, Orchestrator, RescoreService};
pub use errors::{AcquisitionError, EvaluationError, OrchestrationError};
pub use evaluator::MetricEvaluator;
pub use metrics_api::{Score, Scorer, ScorerRegistry};
