//! Request templating and response field-mapping for external models.
//!
//! Two small, fully specified interpreters:
//!
//! - [`RequestTemplate`]: a JSON object deep-copied for every call, with the live request
//!   fields overlaid on top. Overlay rule: when both sides hold an object under the same key the
//!   objects are merged key by key (recursively), otherwise the live value replaces the
//!   template value. Keys only present in the template are kept untouched.
//! - [`PathExpr`]: a dot-separated list of keys (`result.tokenCounts`). Each segment descends one
//!   level: into an object by key, or into an array when the segment is a decimal index.
//!   There are no wildcards, escapes or functions. A missing segment yields `None`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A caller-declared request body skeleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RequestTemplate(Map<String, Value>);

impl RequestTemplate {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Value the template declares for a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deep-copy the template and overlay `live` onto the copy.
    pub fn overlay(&self, live: Map<String, Value>) -> Value {
        let mut body = self.0.clone();
        merge_into(&mut body, live);
        Value::Object(body)
    }
}

fn merge_into(target: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Dot-separated path into a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathExpr(Vec<String>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path expression is empty")]
    Empty,
    #[error("path expression '{0}' has an empty segment")]
    EmptySegment(String),
}

impl PathExpr {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(raw.to_string()));
        }
        Ok(Self(segments))
    }

    /// Walk `document` one segment at a time.
    pub fn evaluate<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(document, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl TryFrom<String> for PathExpr {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathExpr> for String {
    fn from(path: PathExpr) -> Self {
        path.0.join(".")
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Extraction rules that normalize a provider's response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResponseMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PathExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<PathExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<PathExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<PathExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<PathExpr>,
}

/// Fields extracted from a raw provider body. Absent paths stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedFields {
    pub id: Option<Value>,
    pub object: Option<Value>,
    pub created: Option<Value>,
    pub choices: Option<Value>,
    pub usage: Option<Value>,
}

impl ResponseMapping {
    pub fn extract(&self, raw: &Value) -> MappedFields {
        let pick = |path: &Option<PathExpr>| {
            path.as_ref()
                .and_then(|p| p.evaluate(raw))
                .filter(|v| !v.is_null())
                .cloned()
        };
        MappedFields {
            id: pick(&self.id),
            object: pick(&self.object),
            created: pick(&self.created),
            choices: pick(&self.choices),
            usage: pick(&self.usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn template(value: Value) -> RequestTemplate {
        serde_json::from_value(value).unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn overlay_keeps_template_only_keys() {
        let t = template(json!({"stream": false, "options": {"top_p": 0.9}}));
        let body = t.overlay(object(json!({"model": "llama", "temperature": 0.2})));

        assert_eq!(
            body,
            json!({"stream": false, "options": {"top_p": 0.9}, "model": "llama", "temperature": 0.2})
        );
    }

    #[test]
    fn overlay_replaces_scalars_and_arrays() {
        let t = template(json!({"model": "placeholder", "messages": [{"role": "system", "content": "x"}]}));
        let body = t.overlay(object(json!({
            "model": "llama",
            "messages": [{"role": "user", "content": "hi"}]
        })));

        assert_eq!(body["model"], "llama");
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn overlay_merges_nested_objects() {
        let t = template(json!({"parameters": {"top_k": 40, "temperature": 1.0}}));
        let body = t.overlay(object(json!({"parameters": {"temperature": 0.1}})));

        assert_eq!(body, json!({"parameters": {"top_k": 40, "temperature": 0.1}}));
    }

    #[test]
    fn overlay_does_not_mutate_the_template() {
        let t = template(json!({"a": 1}));
        let _ = t.overlay(object(json!({"a": 2})));
        assert_eq!(t.get("a"), Some(&json!(1)));
    }

    #[test]
    fn path_walks_objects_and_array_indices() {
        let doc = json!({"result": {"outputs": [{"text": "hello"}], "tokenCounts": {"input": 3}}});

        let text = PathExpr::parse("result.outputs.0.text").unwrap();
        assert_eq!(text.evaluate(&doc), Some(&json!("hello")));

        let counts = PathExpr::parse("result.tokenCounts").unwrap();
        assert_eq!(counts.evaluate(&doc), Some(&json!({"input": 3})));
    }

    #[test]
    fn missing_path_is_none_not_error() {
        let doc = json!({"result": {"text": "x"}});
        assert_eq!(PathExpr::parse("result.tokenCounts").unwrap().evaluate(&doc), None);
        assert_eq!(PathExpr::parse("result.text.deeper").unwrap().evaluate(&doc), None);
        assert_eq!(PathExpr::parse("result.1").unwrap().evaluate(&doc), None);
    }

    #[test]
    fn rejects_empty_paths_and_segments() {
        assert_eq!(PathExpr::parse(""), Err(PathError::Empty));
        assert!(matches!(PathExpr::parse("a..b"), Err(PathError::EmptySegment(_))));
        assert!(serde_json::from_value::<ResponseMapping>(json!({"usage": "a."})).is_err());
    }

    #[test]
    fn mapping_extracts_declared_fields() {
        let mapping: ResponseMapping = serde_json::from_value(json!({
            "id": "meta.requestId",
            "choices": "result.choices",
            "usage": "result.tokenCounts"
        }))
        .unwrap();
        let raw = json!({
            "meta": {"requestId": "r-1"},
            "result": {"choices": [{"index": 0}]}
        });

        let fields = mapping.extract(&raw);

        assert_eq!(fields.id, Some(json!("r-1")));
        assert_eq!(fields.choices, Some(json!([{"index": 0}])));
        assert_eq!(fields.usage, None);
        assert_eq!(fields.object, None);
    }

    #[test]
    fn mapping_round_trips_through_serde() {
        let raw = json!({"usage": "result.tokenCounts"});
        let mapping: ResponseMapping = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&mapping).unwrap(), raw);
    }
}
