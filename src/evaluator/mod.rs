//! Pluggable expression back-ends.
//!
//! The decision pipeline only sees the [`Evaluator`] capability set: compile an
//! expression once, then execute the compiled form against an evaluation context
//! and get a boolean back. [`RuleEngine`] pairs one evaluator with the program
//! cache it owns, so cache lifetime follows the engine rather than the process.

mod cel;
mod lua;
mod pool;

pub use cel::{CelEvaluator, CelProgram};
pub use lua::{LuaEvaluator, LuaOptions, LuaProgram};
pub use pool::{Pool, PoolGuard};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheStats, ProgramCache};
use crate::catalog::Rule;
use crate::context::EvaluationContext;
use crate::error::{AuthzError, AuthzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Cel,
    Lua,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cel => write!(f, "cel"),
            Backend::Lua => write!(f, "lua"),
        }
    }
}

impl FromStr for Backend {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cel" => Ok(Backend::Cel),
            "lua" => Ok(Backend::Lua),
            other => Err(AuthzError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

pub trait Evaluator: Send + Sync {
    /// Evaluator-specific executable form of one expression.
    type Program: Send + Sync;

    fn backend(&self) -> Backend;

    /// Fails with a compile error when the expression is syntactically invalid or
    /// references a variable outside the declared set (where the backend can tell).
    fn compile(&self, expression: &str) -> AuthzResult<Self::Program>;

    /// Run a compiled program. Any result other than a boolean is an error.
    fn execute(&self, program: &Self::Program, expression: &str, ctx: &EvaluationContext) -> AuthzResult<bool>;
}

/// An evaluator together with its compiled-program cache.
pub struct RuleEngine<E: Evaluator> {
    evaluator: E,
    cache: ProgramCache<E::Program>,
}

impl<E: Evaluator> fmt::Debug for RuleEngine<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleEngine")
            .field("backend", &self.evaluator.backend())
            .field("cache", &self.cache)
            .finish()
    }
}

impl<E: Evaluator> RuleEngine<E> {
    pub fn new(evaluator: E) -> Self {
        Self { evaluator, cache: ProgramCache::new() }
    }

    pub fn backend(&self) -> Backend {
        self.evaluator.backend()
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn program(&self, expression: &str) -> AuthzResult<Arc<E::Program>> {
        self.cache.get_or_compile(expression, |e| self.evaluator.compile(e))
    }

    pub fn run(&self, rule: &Rule, ctx: &EvaluationContext) -> AuthzResult<bool> {
        let program = self.program(&rule.expression)?;
        self.evaluator.execute(&program, &rule.expression, ctx)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
