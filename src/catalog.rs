//! Rule catalog: immutable mapping of fully-qualified method name to an ordered rule set.
//!
//! The catalog is normally produced by a code-generation or configuration step and
//! handed over finished. It is validated once at construction so malformed rule
//! definitions fail at startup instead of per request. After construction it is
//! read-only and can be shared across threads behind an `Arc` without locking.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuthzError, AuthzResult};

/// Literal expression that authorizes every call without invoking an evaluator.
pub const ALLOW_ALL: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub expression: String,
}

impl Rule {
    pub fn new(expression: impl Into<String>) -> Self {
        Self { expression: expression.into() }
    }
}

/// Ordered rules for one method; the first rule evaluating to `true` wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_expressions<I, S>(expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { rules: expressions.into_iter().map(Rule::new).collect() }
    }

    pub fn allow_all() -> Self {
        Self::from_expressions([ALLOW_ALL])
    }

    /// True only for the single literal `"*"` rule.
    pub fn is_allow_all(&self) -> bool {
        self.rules.len() == 1 && self.rules[0].expression.trim() == ALLOW_ALL
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    methods: HashMap<String, RuleSet>,
}

impl RuleCatalog {
    /// Build and validate a catalog. Fails on the first malformed entry.
    pub fn new(methods: HashMap<String, RuleSet>) -> AuthzResult<Self> {
        for (method, set) in methods.iter() {
            validate_entry(method, set)?;
        }
        debug!(target: "authz", "rule catalog loaded: {} methods", methods.len());
        Ok(Self { methods })
    }

    pub fn builder() -> RuleCatalogBuilder {
        RuleCatalogBuilder::default()
    }

    /// Parse the JSON form `{ "<method>": { "rules": [ { "expression": "..." } ] } }`.
    pub fn from_json_str(text: &str) -> AuthzResult<Self> {
        let methods: HashMap<String, RuleSet> = serde_json::from_str(text)
            .map_err(|e| AuthzError::Catalog(format!("invalid catalog json: {}", e)))?;
        Self::new(methods)
    }

    pub fn from_file(path: &Path) -> AuthzResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AuthzError::Catalog(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn lookup(&self, method: &str) -> Option<&RuleSet> {
        self.methods.get(method)
    }

    /// True when some other method under the same `/service/` prefix has rules.
    pub fn service_covered(&self, method: &str) -> bool {
        let Some(service) = service_prefix(method) else { return false; };
        self.methods
            .iter()
            .any(|(k, set)| k != method && !set.rules.is_empty() && k.starts_with(service))
    }

    /// Every distinct expression text in the catalog, excluding the allow-all sentinel.
    pub fn distinct_expressions(&self) -> BTreeSet<&str> {
        self.methods
            .values()
            .filter(|set| !set.is_allow_all())
            .flat_map(|set| set.rules.iter().map(|r| r.expression.as_str()))
            .collect()
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RuleCatalogBuilder {
    methods: HashMap<String, RuleSet>,
    duplicates: Vec<String>,
}

impl RuleCatalogBuilder {
    pub fn method<I, S>(mut self, method: &str, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.methods.insert(method.to_string(), RuleSet::from_expressions(expressions)).is_some() {
            self.duplicates.push(method.to_string());
        }
        self
    }

    pub fn build(self) -> AuthzResult<RuleCatalog> {
        if let Some(dup) = self.duplicates.first() {
            return Err(AuthzError::Catalog(format!("method '{}' defined twice", dup)));
        }
        RuleCatalog::new(self.methods)
    }
}

/// `"/pkg.Service/Method"` -> `"/pkg.Service/"`. Methods not shaped like a
/// gRPC full method name have no service and therefore no siblings.
pub fn service_prefix(method: &str) -> Option<&str> {
    let rest = method.strip_prefix('/')?;
    let slash = rest.find('/')?;
    if slash == 0 {
        return None;
    }
    Some(&method[..slash + 2])
}

fn validate_entry(method: &str, set: &RuleSet) -> AuthzResult<()> {
    if method.trim().is_empty() {
        return Err(AuthzError::Catalog("empty method identifier".into()));
    }
    for (i, rule) in set.rules.iter().enumerate() {
        let expr = rule.expression.trim();
        if expr.is_empty() {
            return Err(AuthzError::Catalog(format!("{}: rule {} has an empty expression", method, i)));
        }
        if expr == ALLOW_ALL && set.rules.len() > 1 {
            return Err(AuthzError::Catalog(format!(
                "{}: '*' must be the only rule of its rule set",
                method
            )));
        }
    }
    Ok(())
}
