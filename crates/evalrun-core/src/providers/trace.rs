use super::{AcquireContext, OutputProvider, ProviderKind};
use crate::errors::AcquisitionError;
use crate::model::{Output, Role, TestCase, Turn};
use crate::storage::Persistence;
use crate::trace::{COMPLETION_KEYS, PROMPT_KEYS};
use async_trait::async_trait;
use std::sync::Arc;

/// Rebuilds a single-turn output from the root span of a stored trace.
pub struct TraceOutput {
    store: Arc<dyn Persistence>,
}

impl TraceOutput {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OutputProvider for TraceOutput {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Trace
    }

    async fn acquire(
        &self,
        tc: &TestCase,
        _ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        let trace_id = tc.trace_id.as_deref().ok_or_else(|| {
            AcquisitionError::trace_incomplete("<none>", format!("test case {} has no trace id", tc.id))
        })?;

        let trace = self
            .store
            .load_trace(trace_id)
            .map_err(|e| AcquisitionError::trace_incomplete(trace_id, format!("load failed: {}", e)))?
            .ok_or_else(|| AcquisitionError::trace_incomplete(trace_id, "trace not found"))?;

        let root = trace
            .root_span()
            .ok_or_else(|| AcquisitionError::trace_incomplete(trace_id, "no root span"))?;

        let prompt = root.text_attr(PROMPT_KEYS).ok_or_else(|| {
            AcquisitionError::trace_incomplete(trace_id, "root span has no prompt attribute")
        })?;
        let response = root.text_attr(COMPLETION_KEYS).ok_or_else(|| {
            AcquisitionError::trace_incomplete(trace_id, "root span has no completion attribute")
        })?;

        let turn = Turn {
            role: Role::Assistant,
            content: response,
            tool_calls: trace.tool_calls(),
        };
        let mut output = Output::single_turn(prompt, turn, self.kind().as_str());
        output.meta = serde_json::json!({
            "trace_id": trace.trace_id,
            "root_span_id": root.span_id,
        });
        Ok(output)
    }
}

/// Multi-turn reconstruction from traces is not available; every call fails
/// with `NotSupported` and never yields a partial output.
pub struct MultiTurnTraceOutput;

#[async_trait]
impl OutputProvider for MultiTurnTraceOutput {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MultiTurnTrace
    }

    async fn acquire(
        &self,
        _tc: &TestCase,
        _ctx: &AcquireContext,
    ) -> Result<Output, AcquisitionError> {
        Err(AcquisitionError::NotSupported {
            what: "multi-turn output reconstruction from traces".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::trace::{Span, Trace};
    use std::time::Duration;

    fn span(id: &str, parent: Option<&str>, attrs: serde_json::Value) -> Span {
        Span {
            span_id: id.into(),
            parent_span_id: parent.map(String::from),
            name: id.into(),
            start_time_unix_nano: 0,
            attributes: serde_json::from_value(attrs).unwrap(),
        }
    }

    fn setup(trace: Trace) -> TraceOutput {
        let s = Store::memory().unwrap();
        s.init_schema().unwrap();
        s.save_trace(&trace).unwrap();
        TraceOutput::new(Arc::new(s))
    }

    fn ctx() -> AcquireContext {
        AcquireContext::new("run", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn reconstructs_single_turn_from_root_span() {
        let provider = setup(Trace {
            trace_id: "tr-1".into(),
            spans: vec![
                span(
                    "root",
                    None,
                    serde_json::json!({"gen_ai.prompt": "weather?", "gen_ai.completion": "sunny"}),
                ),
                span("tool", Some("root"), serde_json::json!({"tool.name": "forecast"})),
            ],
        });
        let tc = TestCase::single_turn("t1", "ignored").with_trace("tr-1");
        let out = provider.acquire(&tc, &ctx()).await.unwrap();
        assert_eq!(out.input, "weather?");
        assert_eq!(out.final_response(), Some("sunny"));
        assert_eq!(out.tool_calls().count(), 1);
        assert_eq!(out.source, "trace");
    }

    #[tokio::test]
    async fn missing_attributes_are_trace_incomplete() {
        let provider = setup(Trace {
            trace_id: "tr-2".into(),
            spans: vec![span("root", None, serde_json::json!({"gen_ai.prompt": "weather?"}))],
        });
        let tc = TestCase::single_turn("t1", "x").with_trace("tr-2");
        let err = provider.acquire(&tc, &ctx()).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::TraceIncomplete { ref reason, .. } if reason.contains("completion")));

        let err = provider
            .acquire(&TestCase::single_turn("t2", "x").with_trace("nope"), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "trace_incomplete");

        let err = provider
            .acquire(&TestCase::single_turn("t3", "x"), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "trace_incomplete");
    }

    #[tokio::test]
    async fn multi_turn_trace_is_not_supported() {
        let provider = MultiTurnTraceOutput;
        for _ in 0..3 {
            let err = provider
                .acquire(&TestCase::multi_turn("c1", "x"), &ctx())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "not_supported");
        }
    }
}
