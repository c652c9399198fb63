//! Identity extraction: turning call information into the `user` value that
//! expressions see. The extractor runs once per call, after the whitelist and
//! selector checks and before any rule.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Metadata;

/// What the transport knows about a call before its handler runs.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    pub method: String,
    pub metadata: Metadata,
    pub deadline: Option<Instant>,
}

impl CallInfo {
    pub fn new(method: impl Into<String>, metadata: Metadata) -> Self {
        Self { method: method.into(), metadata, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, call: &CallInfo) -> Result<Value>;
}

impl<F> IdentityExtractor for F
where
    F: Fn(&CallInfo) -> Result<Value> + Send + Sync,
{
    fn extract(&self, call: &CallInfo) -> Result<Value> {
        self(call)
    }
}

/// Binds `user` to null for every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

impl IdentityExtractor for NoIdentity {
    fn extract(&self, _call: &CallInfo) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Serialize any user type into the structured form expressions read.
pub fn to_user_value<T: Serialize>(user: &T) -> Result<Value> {
    serde_json::to_value(user).map_err(|e| anyhow!("user is not serializable: {}", e))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// Builds a [`Principal`] from trusted upstream headers, e.g. set by an auth proxy.
/// Missing user header is an extraction failure.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    pub user_header: String,
    pub roles_header: String,
    /// Header prefix whose remaining suffix becomes an attribute name.
    pub attr_prefix: String,
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self {
            user_header: "x-user-id".into(),
            roles_header: "x-user-roles".into(),
            attr_prefix: "x-user-attr-".into(),
        }
    }
}

impl IdentityExtractor for HeaderIdentity {
    fn extract(&self, call: &CallInfo) -> Result<Value> {
        let user_id = call
            .metadata
            .get(&self.user_header)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("missing {} header", self.user_header))?;
        let roles = call
            .metadata
            .get_all(&self.roles_header)
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect();
        let attrs = call
            .metadata
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(self.attr_prefix.as_str()).map(|name| (name.to_string(), v.join(","))))
            .collect();
        to_user_value(&Principal { user_id: user_id.to_string(), roles, attrs })
    }
}
