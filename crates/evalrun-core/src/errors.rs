//! Error taxonomy for the execution pipeline.
//!
//! Acquisition errors are per test case and may be retried; evaluation errors
//! are per metric and always isolated; orchestration errors abort the
//! requested operation and go straight back to the caller.

use std::fmt::{Display, Formatter};

/// Failure to obtain an [`Output`](crate::model::Output) for a test case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("target unreachable: {detail}")]
    TargetUnreachable { detail: String },

    /// The target answered, but with a reply that will not improve on retry.
    #[error("target rejected request: {detail}")]
    TargetRejected { detail: String },

    #[error("target timed out after {timeout_ms}ms")]
    TargetTimeout { timeout_ms: u64 },

    #[error("conversation aborted: {reason}")]
    ConversationAborted { reason: String },

    #[error("trace {trace_id} incomplete: {reason}")]
    TraceIncomplete { trace_id: String, reason: String },

    #[error("test result not found: {result_id}")]
    ResultNotFound { result_id: String },

    #[error("not supported: {what}")]
    NotSupported { what: String },

    #[error("acquisition cancelled")]
    Cancelled,
}

impl AcquisitionError {
    /// Only transient network classes are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TargetUnreachable { .. } | Self::TargetTimeout { .. }
        )
    }

    /// Stable machine-readable kind, persisted on results and attempts.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TargetUnreachable { .. } => "target_unreachable",
            Self::TargetRejected { .. } => "target_rejected",
            Self::TargetTimeout { .. } => "target_timeout",
            Self::ConversationAborted { .. } => "conversation_aborted",
            Self::TraceIncomplete { .. } => "trace_incomplete",
            Self::ResultNotFound { .. } => "result_not_found",
            Self::NotSupported { .. } => "not_supported",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::TargetUnreachable {
            detail: detail.into(),
        }
    }

    pub fn trace_incomplete(trace_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TraceIncomplete {
            trace_id: trace_id.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single metric. Recorded on its MetricResult, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    #[error("metric '{metric}' has scope {scope} but the output is {mode}")]
    ScopeMismatch {
        metric: String,
        scope: String,
        mode: String,
    },

    #[error("scorer '{metric}' failed: {message}")]
    ScorerFailed { metric: String, message: String },

    #[error("scorer '{metric}' panicked: {message}")]
    ScorerPanicked { metric: String, message: String },
}

/// Errors surfaced directly to the caller of an orchestration operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("test run not found: {0}")]
    RunNotFound(String),

    #[error("test run {run_id} is not finished (status: {status})")]
    RunNotFinished { run_id: String, status: String },

    #[error("test set not found: {0}")]
    TestSetNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigError: {}", self.0)
    }
}
impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_classes_are_retryable() {
        assert!(AcquisitionError::unreachable("connection refused").is_retryable());
        assert!(AcquisitionError::TargetTimeout { timeout_ms: 10 }.is_retryable());
        assert!(!AcquisitionError::ConversationAborted {
            reason: "step budget".into()
        }
        .is_retryable());
        assert!(!AcquisitionError::trace_incomplete("t1", "no root span").is_retryable());
        assert!(!AcquisitionError::ResultNotFound {
            result_id: "r".into()
        }
        .is_retryable());
        assert!(!AcquisitionError::NotSupported { what: "x".into() }.is_retryable());
        assert!(!AcquisitionError::TargetRejected {
            detail: "status 400".into()
        }
        .is_retryable());
        assert!(!AcquisitionError::Cancelled.is_retryable());
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            AcquisitionError::TargetTimeout { timeout_ms: 1 }.kind(),
            "target_timeout"
        );
        assert_eq!(
            AcquisitionError::NotSupported { what: "x".into() }.kind(),
            "not_supported"
        );
    }

    #[test]
    fn storage_errors_convert_transparently() {
        let err: OrchestrationError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
    }
}
