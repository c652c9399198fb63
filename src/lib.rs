//! Request-time authorization for RPC methods.
//!
//! Each method maps to an ordered list of boolean expressions over the caller's
//! identity, the decoded request, call metadata, the stream flag and the method
//! name. Expressions are compiled once and cached; the first rule that returns
//! `true` authorizes the call. Expressions are written in CEL or in Lua.

pub mod authorizer;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod http;
pub mod identity;
pub mod interceptor;
pub mod selector;

pub use authorizer::{Authorize, AuthorizerChain, Decision, DecisionReason, FallbackPolicy, RuleAuthorizer};
pub use cache::{CacheStats, ProgramCache};
pub use catalog::{Rule, RuleCatalog, RuleSet, ALLOW_ALL};
pub use config::AuthorizerConfig;
pub use context::{EvaluationContext, ExpressionVar, Metadata};
pub use error::{AuthzError, AuthzResult, Code};
pub use evaluator::{Backend, CelEvaluator, Evaluator, LuaEvaluator, LuaOptions, RuleEngine};
pub use http::{authorize_http, HttpAuthorizer};
pub use identity::{CallInfo, HeaderIdentity, IdentityExtractor, NoIdentity, Principal};
pub use interceptor::Interceptor;
pub use selector::{Selector, SelectorConfig, Whitelist};
