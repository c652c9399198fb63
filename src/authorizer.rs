//! Rule resolution and evaluation for one call.
//!
//! [`RuleAuthorizer`] takes a built evaluation context, resolves the method's
//! rule set from the catalog and runs the rules in declared order. The first rule
//! that returns `true` allows; any error stops evaluation and is returned as is.
//! Unknown methods go through the configured [`FallbackPolicy`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheStats;
use crate::catalog::RuleCatalog;
use crate::context::EvaluationContext;
use crate::error::{AuthzError, AuthzResult};
use crate::evaluator::{Backend, Evaluator, RuleEngine};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Method is on the bypass list.
    Whitelisted,
    /// Selectors are configured and none matched the call.
    NotSelected,
    /// Rule set is the `"*"` sentinel.
    AllowAll,
    /// Unknown method whose service has other methods with rules.
    ServiceCovered,
    /// Unknown method allowed by [`FallbackPolicy::Allow`].
    UnknownAllowed,
    /// Zero-based index of the first rule that returned true.
    Rule(usize),
    NoRuleMatched,
    UnknownMethod,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::Whitelisted => write!(f, "whitelisted"),
            DecisionReason::NotSelected => write!(f, "not selected"),
            DecisionReason::AllowAll => write!(f, "allow all"),
            DecisionReason::ServiceCovered => write!(f, "service covered"),
            DecisionReason::UnknownAllowed => write!(f, "unknown method allowed"),
            DecisionReason::Rule(i) => write!(f, "rule #{}", i),
            DecisionReason::NoRuleMatched => write!(f, "no rule matched"),
            DecisionReason::UnknownMethod => write!(f, "unknown method"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn allow(reason: DecisionReason) -> Self {
        Self { allow: true, reason }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        Self { allow: false, reason }
    }
}

/// What to do with a method that has no entry in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Allow when a sibling method of the same service has rules, otherwise deny.
    #[default]
    CoveredService,
    Deny,
    Allow,
}

impl std::str::FromStr for FallbackPolicy {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "covered_service" => Ok(FallbackPolicy::CoveredService),
            "deny" => Ok(FallbackPolicy::Deny),
            "allow" => Ok(FallbackPolicy::Allow),
            other => Err(AuthzError::Config(format!("unknown fallback policy '{}'", other))),
        }
    }
}

/// A decision source that works on an already built evaluation context.
pub trait Authorize: Send + Sync {
    fn name(&self) -> String;

    fn authorize(&self, ctx: &EvaluationContext) -> AuthzResult<Decision>;

    /// Compile everything up front; returns how many programs were compiled.
    fn precompile(&self) -> AuthzResult<usize> {
        Ok(0)
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        None
    }
}

pub struct RuleAuthorizer<E: Evaluator> {
    catalog: Arc<RuleCatalog>,
    engine: RuleEngine<E>,
    fallback: FallbackPolicy,
}

impl<E: Evaluator> fmt::Debug for RuleAuthorizer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleAuthorizer")
            .field("methods", &self.catalog.len())
            .field("engine", &self.engine)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl<E: Evaluator> RuleAuthorizer<E> {
    pub fn new(catalog: Arc<RuleCatalog>, evaluator: E) -> Self {
        Self { catalog, engine: RuleEngine::new(evaluator), fallback: FallbackPolicy::default() }
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn backend(&self) -> Backend {
        self.engine.backend()
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn engine(&self) -> &RuleEngine<E> {
        &self.engine
    }

    fn unknown_method(&self, method: &str) -> Decision {
        match self.fallback {
            FallbackPolicy::Allow => Decision::allow(DecisionReason::UnknownAllowed),
            FallbackPolicy::Deny => Decision::deny(DecisionReason::UnknownMethod),
            FallbackPolicy::CoveredService => {
                if self.catalog.service_covered(method) {
                    Decision::allow(DecisionReason::ServiceCovered)
                } else {
                    Decision::deny(DecisionReason::UnknownMethod)
                }
            }
        }
    }
}

impl<E: Evaluator> Authorize for RuleAuthorizer<E> {
    fn name(&self) -> String {
        format!("{}-rules", self.backend())
    }

    fn authorize(&self, ctx: &EvaluationContext) -> AuthzResult<Decision> {
        let Some(set) = self.catalog.lookup(&ctx.method) else {
            let d = self.unknown_method(&ctx.method);
            debug!(target: "authz", "{} not in catalog: {} ({:?} fallback)", ctx.method, d.reason, self.fallback);
            return Ok(d);
        };
        if set.is_allow_all() {
            return Ok(Decision::allow(DecisionReason::AllowAll));
        }
        for (i, rule) in set.rules.iter().enumerate() {
            if self.engine.run(rule, ctx)? {
                debug!(target: "authz", "{} allowed by rule #{}", ctx.method, i);
                return Ok(Decision::allow(DecisionReason::Rule(i)));
            }
        }
        Ok(Decision::deny(DecisionReason::NoRuleMatched))
    }

    fn precompile(&self) -> AuthzResult<usize> {
        let mut n = 0;
        for expression in self.catalog.distinct_expressions() {
            self.engine.program(expression)?;
            n += 1;
        }
        debug!(target: "authz", "precompiled {} {} expressions", n, self.backend());
        Ok(n)
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        Some(self.engine.cache_stats())
    }
}

/// Several authorizers tried in order; the first allow wins and any error
/// aborts the chain. Denies carry the last authorizer's reason.
#[derive(Default, Clone)]
pub struct AuthorizerChain {
    links: Vec<Arc<dyn Authorize>>,
}

impl fmt::Debug for AuthorizerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.links.iter().map(|a| a.name())).finish()
    }
}

impl AuthorizerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authorizer: Arc<dyn Authorize>) -> Self {
        self.links.push(authorizer);
        self
    }

    pub fn push(&mut self, authorizer: Arc<dyn Authorize>) {
        self.links.push(authorizer);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Authorize for AuthorizerChain {
    fn name(&self) -> String {
        self.links.iter().map(|a| a.name()).collect::<Vec<_>>().join("|")
    }

    fn authorize(&self, ctx: &EvaluationContext) -> AuthzResult<Decision> {
        let mut last = Decision::deny(DecisionReason::NoRuleMatched);
        for link in &self.links {
            let d = link.authorize(ctx)?;
            if d.allow {
                return Ok(d);
            }
            last = d;
        }
        Ok(last)
    }

    fn precompile(&self) -> AuthzResult<usize> {
        let mut n = 0;
        for link in &self.links {
            n += link.precompile()?;
        }
        Ok(n)
    }
}
