//! In-process doubles for targets, agents and providers.
//!
//! Used by the crate's own tests and by downstream crates that need a
//! deterministic pipeline without a network.

use super::{
    AcquireContext, AgentError, ConversationAgent, OutputProvider, ProviderKind, Target,
    TargetError, TargetResponse,
};
use crate::errors::AcquisitionError;
use crate::model::{Output, TestCase, Turn};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Always answers with the same text, optionally after a delay.
pub struct FakeTarget {
    reply: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeTarget {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Target for FakeTarget {
    async fn invoke(&self, _prompt: &str) -> Result<TargetResponse, TargetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        Ok(TargetResponse::text(self.reply.clone()))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

type Script = VecDeque<Result<TargetResponse, TargetError>>;

/// Replays scripted responses in order.
///
/// A per-prompt script takes precedence over the shared one. Once a script
/// runs dry the target echoes the prompt back.
pub struct ScriptedTarget {
    shared: Mutex<Script>,
    per_prompt: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTarget {
    pub fn new(script: Vec<Result<TargetResponse, TargetError>>) -> Self {
        Self {
            shared: Mutex::new(script.into()),
            per_prompt: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prompt_script(
        self,
        prompt: impl Into<String>,
        script: Vec<Result<TargetResponse, TargetError>>,
    ) -> Self {
        if let Ok(mut map) = self.per_prompt.lock() {
            map.insert(prompt.into(), script.into());
        }
        self
    }

    pub fn calls_for(&self, prompt: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(prompt).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|c| c.values().sum()).unwrap_or(0)
    }

    fn next(&self, prompt: &str) -> Option<Result<TargetResponse, TargetError>> {
        if let Ok(mut map) = self.per_prompt.lock() {
            if let Some(script) = map.get_mut(prompt) {
                return script.pop_front();
            }
        }
        self.shared.lock().ok()?.pop_front()
    }
}

#[async_trait]
impl Target for ScriptedTarget {
    async fn invoke(&self, prompt: &str) -> Result<TargetResponse, TargetError> {
        if let Ok(mut c) = self.calls.lock() {
            *c.entry(prompt.to_string()).or_insert(0) += 1;
        }
        self.next(prompt)
            .unwrap_or_else(|| Ok(TargetResponse::text(format!("echo: {}", prompt))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Conversation agent returning a canned transcript, or aborting.
pub struct FakeAgent {
    turns: Vec<Turn>,
    abort: Option<String>,
    delay: Option<Duration>,
}

impl FakeAgent {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns,
            abort: None,
            delay: None,
        }
    }

    pub fn aborting(reason: impl Into<String>) -> Self {
        Self {
            turns: Vec::new(),
            abort: Some(reason.into()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ConversationAgent for FakeAgent {
    async fn run_scenario(&self, _tc: &TestCase) -> Result<Vec<Turn>, AgentError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        match &self.abort {
            Some(reason) => Err(AgentError::Aborted {
                reason: reason.clone(),
            }),
            None => Ok(self.turns.clone()),
        }
    }
}

/// Provider that must never be reached. Panics on `acquire`.
///
/// Wire it in as the live provider to prove a code path never calls the
/// target, e.g. rescoring.
pub struct PanickingProvider;

#[async_trait]
impl OutputProvider for PanickingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SingleTurn
    }

    async fn acquire(
        &self,
        tc: &TestCase,
        _ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        panic!("PanickingProvider::acquire called for test case {}", tc.id);
    }
}

/// Target that panics when invoked; the [`Target`] counterpart of
/// [`PanickingProvider`].
pub struct PanickingTarget;

#[async_trait]
impl Target for PanickingTarget {
    async fn invoke(&self, prompt: &str) -> Result<TargetResponse, TargetError> {
        panic!("PanickingTarget::invoke called with prompt {:?}", prompt);
    }

    fn name(&self) -> &str {
        "panicking"
    }
}
