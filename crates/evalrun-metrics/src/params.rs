//! Parameter extraction shared by the scorers.

use anyhow::{bail, Context};
use serde_json::Value;

/// A string or list of strings under the first present key.
pub(crate) fn string_list(params: &Value, keys: &[&str]) -> anyhow::Result<Vec<String>> {
    let Some(v) = keys.iter().find_map(|k| params.get(*k)) else {
        bail!("missing parameter '{}'", keys.join("' or '"));
    };
    match v {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(String::from)
                    .with_context(|| format!("'{}' must contain only strings", keys[0]))
            })
            .collect(),
        _ => bail!("'{}' must be a string or a list of strings", keys[0]),
    }
}

pub(crate) fn string(params: &Value, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .with_context(|| format!("missing string parameter '{}'", key))
}

pub(crate) fn flag(params: &Value, key: &str, default: bool) -> anyhow::Result<bool> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => bail!("'{}' must be a boolean", key),
    }
}

/// Case-folds when matching is case-insensitive.
pub(crate) fn fold(s: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        s.to_string()
    } else {
        s.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_list_accepts_scalar_and_list() {
        assert_eq!(string_list(&json!({"value": "a"}), &["values", "value"]).unwrap(), vec!["a"]);
        assert_eq!(
            string_list(&json!({"values": ["a", "b"]}), &["values", "value"]).unwrap(),
            vec!["a", "b"]
        );
        assert!(string_list(&json!({"values": [1]}), &["values"]).is_err());
        assert!(string_list(&json!({}), &["values"]).is_err());
    }

    #[test]
    fn flag_rejects_non_booleans() {
        assert!(flag(&json!({}), "x", true).unwrap());
        assert!(flag(&json!({"x": "yes"}), "x", true).is_err());
    }
}
