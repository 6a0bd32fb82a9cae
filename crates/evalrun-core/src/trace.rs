//! Stored telemetry traces and the attribute conventions used to rebuild
//! an output from them.

use crate::model::ToolCallRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const PROMPT_KEYS: &[&str] = &["gen_ai.prompt", "input.value"];
pub const COMPLETION_KEYS: &[&str] = &["gen_ai.completion", "output.value"];
pub const TOOL_NAME_KEYS: &[&str] = &["gen_ai.tool.name", "tool.name"];
pub const TOOL_ARGS_KEYS: &[&str] = &["gen_ai.tool.arguments", "tool.arguments"];
pub const TOOL_RESULT_KEYS: &[&str] = &["gen_ai.tool.result", "tool.result"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub start_time_unix_nano: u64,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl Span {
    /// First present attribute among `keys`, rendered as text.
    pub fn text_attr(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.attributes.get(*k)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    pub fn json_attr(&self, keys: &[&str]) -> Option<Value> {
        keys.iter()
            .find_map(|k| self.attributes.get(*k))
            .map(|v| json_best_effort_value(v.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<Span>,
}

impl Trace {
    /// The span without a parent; the earliest one wins if several exist.
    pub fn root_span(&self) -> Option<&Span> {
        self.spans
            .iter()
            .filter(|s| s.parent_span_id.as_deref().map_or(true, str::is_empty))
            .min_by(|a, b| {
                a.start_time_unix_nano
                    .cmp(&b.start_time_unix_nano)
                    .then_with(|| a.span_id.cmp(&b.span_id))
            })
    }

    /// Tool-call spans in start order.
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        let mut spans: Vec<&Span> = self
            .spans
            .iter()
            .filter(|s| s.text_attr(TOOL_NAME_KEYS).is_some())
            .collect();
        spans.sort_by_key(|s| s.start_time_unix_nano);
        spans
            .into_iter()
            .filter_map(|s| {
                Some(ToolCallRecord {
                    tool_name: s.text_attr(TOOL_NAME_KEYS)?,
                    args: s.json_attr(TOOL_ARGS_KEYS).unwrap_or(Value::Null),
                    result: s.json_attr(TOOL_RESULT_KEYS),
                    error: s.text_attr(&["error.message"]),
                })
            })
            .collect()
    }
}

/// Exporters often stringify JSON attributes; undo that when it parses.
fn json_best_effort_value(v: Value) -> Value {
    match v {
        Value::String(s) => {
            let t = s.trim();
            if t.starts_with('{') || t.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(t) {
                    return parsed;
                }
            }
            Value::String(s)
        }
        other => other,
    }
}
