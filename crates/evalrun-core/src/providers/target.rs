use crate::model::ToolCallRecord;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// The AI system under test, invoked once per single-turn case.
#[async_trait]
pub trait Target: Send + Sync {
    async fn invoke(&self, prompt: &str) -> Result<TargetResponse, TargetError>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub meta: Value,
}

impl TargetResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            meta: json!({}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timeout")]
    Timeout,
    /// Deterministic refusal (4xx, malformed reply); not worth retrying.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// JSON-over-HTTP target: `POST {endpoint}` with `{"prompt": ...}`.
///
/// The reply's text is read from `response`, `output`, `text` or `content`;
/// an optional `tool_calls` array is carried into the turn.
pub struct HttpTarget {
    endpoint: String,
    client: reqwest::Client,
    headers: Vec<(String, String)>,
}

impl HttpTarget {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TargetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TargetError::Unreachable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            headers: Vec::new(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn invoke(&self, prompt: &str) -> Result<TargetResponse, TargetError> {
        let mut req = self.client.post(&self.endpoint).json(&json!({ "prompt": prompt }));
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().await.map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = format!(
                "target returned status {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            );
            // 408 and 429 are the client errors that clear up on their own.
            let transient = status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(if transient {
                TargetError::Unreachable(detail)
            } else {
                TargetError::Rejected(detail)
            });
        }

        let body: Value = resp.json().await.map_err(map_reqwest_error)?;
        parse_response_body(body)
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TargetError {
    if e.is_timeout() {
        TargetError::Timeout
    } else {
        TargetError::Unreachable(e.to_string())
    }
}

fn parse_response_body(body: Value) -> Result<TargetResponse, TargetError> {
    let content = ["response", "output", "text", "content"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .map(String::from)
        .ok_or_else(|| {
            TargetError::Rejected("target reply has no response text field".to_string())
        })?;

    let tool_calls = body
        .get("tool_calls")
        .and_then(|v| serde_json::from_value::<Vec<ToolCallRecord>>(v.clone()).ok())
        .unwrap_or_default();

    let meta = body.get("meta").cloned().unwrap_or_else(|| json!({}));

    Ok(TargetResponse {
        content,
        tool_calls,
        meta,
    })
}
