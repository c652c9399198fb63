//! Evaluation context: the variable bindings exposed to a rule expression.
//!
//! A context is built fresh for each call and owned by that call's evaluation only.
//! Metadata arrives multi-valued from the transport and is collapsed here so that
//! expressions always see one comma-joined string per key.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::Value;

/// Variable names visible inside expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionVar {
    Request,
    Metadata,
    User,
    IsStream,
    Method,
}

impl ExpressionVar {
    pub const ALL: [ExpressionVar; 5] = [
        ExpressionVar::Request,
        ExpressionVar::Metadata,
        ExpressionVar::User,
        ExpressionVar::IsStream,
        ExpressionVar::Method,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExpressionVar::Request => "request",
            ExpressionVar::Metadata => "metadata",
            ExpressionVar::User => "user",
            ExpressionVar::IsStream => "is_stream",
            ExpressionVar::Method => "method",
        }
    }

    pub fn is_declared(name: &str) -> bool {
        Self::ALL.iter().any(|v| v.as_str() == name)
    }
}

/// Header-like call metadata. Keys are kept exactly as the transport supplied them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(key, value);
        self
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value for a key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collapse every key's values into a single comma-separated string.
    pub fn normalized(&self) -> BTreeMap<String, String> {
        self.entries.iter().map(|(k, v)| (k.clone(), v.join(","))).collect()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.append(k, v);
        }
        md
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub user: Value,
    /// Decoded request; always `None` for streaming calls.
    pub request: Option<Value>,
    pub metadata: BTreeMap<String, String>,
    pub is_stream: bool,
    pub method: String,
    /// Inherited from the enclosing call. Not visible to expressions.
    pub deadline: Option<Instant>,
}

impl EvaluationContext {
    pub fn build(user: Value, request: Option<Value>, metadata: &Metadata, is_stream: bool, method: &str) -> Self {
        Self {
            user,
            // payload is not available when a stream is authorized
            request: if is_stream { None } else { request },
            metadata: metadata.normalized(),
            is_stream,
            method: method.to_string(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Request as bound into expressions: absent requests are null.
    pub fn request_value(&self) -> &Value {
        self.request.as_ref().unwrap_or(&Value::Null)
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
