//! Output acquisition.
//!
//! Every test case gets its output from exactly one [`OutputProvider`]. Which
//! one is a pure function of the configuration's [`OutputSource`] and the
//! case's [`TurnMode`], see [`select_provider`].

pub mod agent;
pub mod fake;
pub mod multi_turn;
pub mod single_turn;
pub mod target;
pub mod test_result;
pub mod trace;

use crate::engine::cancel::CancelSignal;
use crate::errors::AcquisitionError;
use crate::model::{Output, OutputSource, TargetBinding, TestCase, TurnMode};
use crate::storage::Persistence;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use agent::{AgentError, ConversationAgent};
pub use multi_turn::MultiTurnOutput;
pub use single_turn::SingleTurnOutput;
pub use target::{HttpTarget, Target, TargetError, TargetResponse};
pub use test_result::TestResultOutput;
pub use trace::{MultiTurnTraceOutput, TraceOutput};

/// Per-invocation context handed to a provider.
#[derive(Debug, Clone)]
pub struct AcquireContext {
    pub run_id: String,
    /// Upper bound for a single live target call.
    pub timeout: Duration,
    pub cancel: CancelSignal,
}

impl AcquireContext {
    pub fn new(run_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            timeout,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
pub trait OutputProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn acquire(
        &self,
        tc: &TestCase,
        ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    SingleTurn,
    MultiTurn,
    TestResult,
    Trace,
    MultiTurnTrace,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::SingleTurn => "single_turn",
            ProviderKind::MultiTurn => "multi_turn",
            ProviderKind::TestResult => "test_result",
            ProviderKind::Trace => "trace",
            ProviderKind::MultiTurnTrace => "multi_turn_trace",
        }
    }
}

/// Total mapping from (source, cardinality) to the provider variant.
pub fn select_provider(source: &OutputSource, mode: TurnMode) -> ProviderKind {
    match (source, mode) {
        (OutputSource::Live, TurnMode::SingleTurn) => ProviderKind::SingleTurn,
        (OutputSource::Live, TurnMode::MultiTurn) => ProviderKind::MultiTurn,
        (OutputSource::Rescore { .. }, _) => ProviderKind::TestResult,
        (OutputSource::Trace, TurnMode::SingleTurn) => ProviderKind::Trace,
        (OutputSource::Trace, TurnMode::MultiTurn) => ProviderKind::MultiTurnTrace,
    }
}

/// Collaborators the provider variants are built from.
///
/// Targets are keyed by endpoint; a configuration reaches the target its
/// [`TargetBinding`] names and no other.
#[derive(Clone)]
pub struct Providers {
    targets: HashMap<String, Arc<dyn Target>>,
    pub agent: Option<Arc<dyn ConversationAgent>>,
    pub store: Arc<dyn Persistence>,
}

impl Providers {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            targets: HashMap::new(),
            agent: None,
            store,
        }
    }

    /// Serves configurations bound to `endpoint` with `target`.
    pub fn with_target(mut self, endpoint: impl Into<String>, target: Arc<dyn Target>) -> Self {
        self.targets.insert(endpoint.into(), target);
        self
    }

    pub fn target_for(&self, binding: &TargetBinding) -> Result<Arc<dyn Target>, AcquisitionError> {
        self.targets
            .get(&binding.endpoint)
            .cloned()
            .ok_or_else(|| AcquisitionError::NotSupported {
                what: format!(
                    "live single-turn acquisition without a target for {}",
                    binding.endpoint
                ),
            })
    }

    pub fn with_agent(mut self, agent: Arc<dyn ConversationAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Instantiate the provider for `kind`. `source_result_id` is the stored
    /// result to replay when `kind` is [`ProviderKind::TestResult`].
    pub fn build(
        &self,
        kind: ProviderKind,
        binding: &TargetBinding,
        source_result_id: Option<&str>,
    ) -> Result<Arc<dyn OutputProvider>, AcquisitionError> {
        Ok(match kind {
            ProviderKind::SingleTurn => Arc::new(SingleTurnOutput::new(self.target_for(binding)?)),
            ProviderKind::MultiTurn => {
                let agent = self.agent.clone().ok_or_else(|| AcquisitionError::NotSupported {
                    what: "live multi-turn acquisition without a conversation agent".into(),
                })?;
                Arc::new(MultiTurnOutput::new(agent))
            }
            ProviderKind::TestResult => {
                let id = source_result_id.ok_or_else(|| AcquisitionError::ResultNotFound {
                    result_id: "<no stored result for test case>".into(),
                })?;
                Arc::new(TestResultOutput::new(self.store.clone(), id))
            }
            ProviderKind::Trace => Arc::new(TraceOutput::new(self.store.clone())),
            ProviderKind::MultiTurnTrace => Arc::new(MultiTurnTraceOutput),
        })
    }
}

/// Stands in for a provider that could not be built; every call fails
/// with the build error.
pub struct UnavailableProvider {
    kind: ProviderKind,
    error: AcquisitionError,
}

impl UnavailableProvider {
    pub fn new(kind: ProviderKind, error: AcquisitionError) -> Self {
        Self { kind, error }
    }
}

#[async_trait]
impl OutputProvider for UnavailableProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn acquire(
        &self,
        _tc: &TestCase,
        _ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        Err(self.error.clone())
    }
}
