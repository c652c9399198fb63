//! Pre-checks that decide whether authorization applies to a call at all.
//!
//! The whitelist is an exact-match bypass. Selectors are activation predicates:
//! when any are configured and none matches, the call passes through untouched.
//! Neither ever produces a deny.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::service_prefix;
use crate::context::Metadata;
use crate::error::{AuthzError, AuthzResult};

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    methods: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { methods: methods.into_iter().map(Into::into).collect() }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

type MatchFn = Arc<dyn Fn(&str, &Metadata) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Selector {
    /// Exact method identifier.
    Method(String),
    /// Every method of one service; accepts `pkg.Service` or `/pkg.Service/`.
    Service(String),
    Prefix(String),
    Pattern(Regex),
    MetadataPresent(String),
    MetadataEquals { key: String, value: String },
    Custom(MatchFn),
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Method(m) => write!(f, "Method({})", m),
            Selector::Service(s) => write!(f, "Service({})", s),
            Selector::Prefix(p) => write!(f, "Prefix({})", p),
            Selector::Pattern(r) => write!(f, "Pattern({})", r.as_str()),
            Selector::MetadataPresent(k) => write!(f, "MetadataPresent({})", k),
            Selector::MetadataEquals { key, value } => write!(f, "MetadataEquals({}={})", key, value),
            Selector::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Selector {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &Metadata) -> bool + Send + Sync + 'static,
    {
        Selector::Custom(Arc::new(f))
    }

    pub fn matches(&self, method: &str, metadata: &Metadata) -> bool {
        match self {
            Selector::Method(m) => m == method,
            Selector::Service(s) => {
                let wanted = s.trim_matches('/');
                service_prefix(method).is_some_and(|p| p.trim_matches('/') == wanted)
            }
            Selector::Prefix(p) => method.starts_with(p.as_str()),
            Selector::Pattern(rx) => rx.is_match(method),
            Selector::MetadataPresent(k) => !metadata.get_all(&k.to_ascii_lowercase()).is_empty(),
            Selector::MetadataEquals { key, value } => {
                metadata.get_all(&key.to_ascii_lowercase()).iter().any(|v| v == value)
            }
            Selector::Custom(f) => f(method, metadata),
        }
    }
}

/// True when no selectors are configured or at least one matches.
pub fn selected(selectors: &[Selector], method: &str, metadata: &Metadata) -> bool {
    selectors.is_empty() || selectors.iter().any(|s| s.matches(method, metadata))
}

/// Serializable selector form used by configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectorConfig {
    Method { method: String },
    Service { service: String },
    Prefix { prefix: String },
    Pattern { pattern: String },
    /// `*` matches within one path segment, `**` across segments.
    Glob { glob: String },
    MetadataPresent { key: String },
    MetadataEquals { key: String, value: String },
}

impl SelectorConfig {
    pub fn build(&self) -> AuthzResult<Selector> {
        Ok(match self {
            SelectorConfig::Method { method } => Selector::Method(method.clone()),
            SelectorConfig::Service { service } => Selector::Service(service.clone()),
            SelectorConfig::Prefix { prefix } => Selector::Prefix(prefix.clone()),
            SelectorConfig::Pattern { pattern } => Selector::Pattern(
                Regex::new(pattern).map_err(|e| AuthzError::Config(format!("selector pattern '{}': {}", pattern, e)))?,
            ),
            SelectorConfig::Glob { glob } => Selector::Pattern(glob_to_regex(glob)?),
            SelectorConfig::MetadataPresent { key } => Selector::MetadataPresent(key.clone()),
            SelectorConfig::MetadataEquals { key, value } => {
                Selector::MetadataEquals { key: key.clone(), value: value.clone() }
            }
        })
    }
}

/// Anchored regex for a method glob: `**` -> `.*`, `*` -> `[^/]*`.
pub fn glob_to_regex(glob: &str) -> AuthzResult<Regex> {
    let escaped = regex::escape(glob).replace("\\*\\*", ".*").replace("\\*", "[^/]*");
    Regex::new(&format!("^{}$", escaped)).map_err(|e| AuthzError::Config(format!("selector glob '{}': {}", glob, e)))
}
