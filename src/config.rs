//! Authorizer configuration.
//!
//! Loaded from a JSON file, then overridden from `AUTHZ_*` environment variables.
//! Every field has a default, so an empty object (or no file at all) is valid.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::authorizer::{Authorize, FallbackPolicy, RuleAuthorizer};
use crate::catalog::RuleCatalog;
use crate::error::{AuthzError, AuthzResult};
use crate::evaluator::{Backend, CelEvaluator, LuaEvaluator, LuaOptions};
use crate::http::{HttpAuthorizer, DEFAULT_MAX_BODY_BYTES};
use crate::identity::IdentityExtractor;
use crate::interceptor::Interceptor;
use crate::selector::{SelectorConfig, Whitelist};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LuaConfig {
    /// Defaults to the number of available cores.
    pub pool_size: Option<usize>,
    /// Zero disables the per-evaluation budget; the call deadline still applies.
    pub eval_timeout_ms: u64,
    pub instruction_check_interval: u32,
    pub builtins: BTreeMap<String, serde_json::Value>,
}

impl Default for LuaConfig {
    fn default() -> Self {
        let d = LuaOptions::default();
        Self {
            pool_size: None,
            eval_timeout_ms: d.eval_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            instruction_check_interval: d.instruction_check_interval,
            builtins: BTreeMap::new(),
        }
    }
}

impl LuaConfig {
    pub fn options(&self) -> LuaOptions {
        let d = LuaOptions::default();
        LuaOptions {
            pool_size: self.pool_size.unwrap_or(d.pool_size),
            eval_timeout: (self.eval_timeout_ms > 0).then(|| Duration::from_millis(self.eval_timeout_ms)),
            instruction_check_interval: self.instruction_check_interval,
            builtins: self.builtins.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { max_body_bytes: DEFAULT_MAX_BODY_BYTES }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthorizerConfig {
    pub backend: Backend,
    pub whitelist: Vec<String>,
    pub selectors: Vec<SelectorConfig>,
    pub fallback: FallbackPolicy,
    /// Compile every catalog expression when building, so bad rules fail at startup.
    pub precompile: bool,
    pub lua: LuaConfig,
    pub http: HttpConfig,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            whitelist: Vec::new(),
            selectors: Vec::new(),
            fallback: FallbackPolicy::default(),
            precompile: true,
            lua: LuaConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, v: &str) -> AuthzResult<T> {
    v.trim().parse::<T>().map_err(|_| AuthzError::Config(format!("{}: '{}' is not a number", name, v)))
}

impl AuthorizerConfig {
    pub fn from_json_str(text: &str) -> AuthzResult<Self> {
        serde_json::from_str(text).map_err(|e| AuthzError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> AuthzResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AuthzError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> AuthzResult<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) -> AuthzResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `AUTHZ_*` overrides from any lookup; unset names leave fields alone.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> AuthzResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AUTHZ_BACKEND") {
            self.backend = v.parse()?;
        }
        if let Some(v) = lookup("AUTHZ_WHITELIST") {
            self.whitelist = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        if let Some(v) = lookup("AUTHZ_FALLBACK") {
            self.fallback = v.parse()?;
        }
        if let Some(v) = lookup("AUTHZ_LUA_POOL_SIZE") {
            self.lua.pool_size = Some(parse_num("AUTHZ_LUA_POOL_SIZE", &v)?);
        }
        if let Some(v) = lookup("AUTHZ_EVAL_TIMEOUT_MS") {
            self.lua.eval_timeout_ms = parse_num("AUTHZ_EVAL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("AUTHZ_PRECOMPILE") {
            self.precompile = parse_bool(&v)
                .ok_or_else(|| AuthzError::Config(format!("AUTHZ_PRECOMPILE: '{}' is not a boolean", v)))?;
        }
        Ok(())
    }

    /// The configured backend over `catalog`, precompiled when requested.
    pub fn authorizer(&self, catalog: Arc<RuleCatalog>) -> AuthzResult<Arc<dyn Authorize>> {
        let authorizer: Arc<dyn Authorize> = match self.backend {
            Backend::Cel => Arc::new(RuleAuthorizer::new(catalog, CelEvaluator::new()).with_fallback(self.fallback)),
            Backend::Lua => Arc::new(
                RuleAuthorizer::new(catalog, LuaEvaluator::with_options(self.lua.options())?).with_fallback(self.fallback),
            ),
        };
        if self.precompile {
            let n = authorizer.precompile()?;
            info!(target: "authz", "{} backend ready: {} expressions compiled", self.backend, n);
        }
        Ok(authorizer)
    }

    pub fn build(&self, catalog: Arc<RuleCatalog>, extractor: Arc<dyn IdentityExtractor>) -> AuthzResult<Interceptor> {
        let selectors = self.selectors.iter().map(SelectorConfig::build).collect::<AuthzResult<Vec<_>>>()?;
        Ok(Interceptor::new(self.authorizer(catalog)?)
            .with_whitelist(Whitelist::new(self.whitelist.iter().cloned()))
            .with_selectors(selectors)
            .with_extractor(extractor))
    }

    pub fn build_http(
        &self,
        catalog: Arc<RuleCatalog>,
        extractor: Arc<dyn IdentityExtractor>,
    ) -> AuthzResult<HttpAuthorizer> {
        Ok(HttpAuthorizer::new(self.build(catalog, extractor)?).with_max_body_bytes(self.http.max_body_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_object_is_all_defaults() {
        let cfg = AuthorizerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, AuthorizerConfig::default());
        assert_eq!(cfg.backend, Backend::Cel);
        assert!(cfg.precompile);
    }

    #[test]
    fn full_document() {
        let cfg = AuthorizerConfig::from_json_str(
            r#"{
                "backend": "lua",
                "whitelist": ["/grpc.health.v1.Health/Check"],
                "selectors": [{"kind": "prefix", "prefix": "/example."}],
                "fallback": "deny",
                "precompile": false,
                "lua": {"pool_size": 2, "eval_timeout_ms": 0, "builtins": {"admins": ["alice"]}},
                "http": {"max_body_bytes": 4096}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.backend, Backend::Lua);
        assert_eq!(cfg.fallback, FallbackPolicy::Deny);
        let opts = cfg.lua.options();
        assert_eq!(opts.pool_size, 2);
        assert_eq!(opts.eval_timeout, None);
        assert_eq!(opts.builtins.len(), 1);
        assert_eq!(cfg.http.max_body_bytes, 4096);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = AuthorizerConfig::from_json_str(r#"{"backnd": "cel"}"#).unwrap_err();
        assert_eq!(err.code_str(), "config_error");
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AUTHZ_BACKEND", "lua"),
            ("AUTHZ_WHITELIST", "/a/b, /c/d,"),
            ("AUTHZ_FALLBACK", "allow"),
            ("AUTHZ_LUA_POOL_SIZE", "3"),
            ("AUTHZ_EVAL_TIMEOUT_MS", "50"),
            ("AUTHZ_PRECOMPILE", "off"),
        ]
        .into_iter()
        .collect();
        let mut cfg = AuthorizerConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.backend, Backend::Lua);
        assert_eq!(cfg.whitelist, vec!["/a/b".to_string(), "/c/d".to_string()]);
        assert_eq!(cfg.fallback, FallbackPolicy::Allow);
        assert_eq!(cfg.lua.pool_size, Some(3));
        assert_eq!(cfg.lua.options().eval_timeout, Some(Duration::from_millis(50)));
        assert!(!cfg.precompile);
    }

    #[test]
    fn bad_env_values_fail() {
        let mut cfg = AuthorizerConfig::default();
        let err = cfg.apply_env_from(|k| (k == "AUTHZ_LUA_POOL_SIZE").then(|| "many".to_string())).unwrap_err();
        assert_eq!(err.code_str(), "config_error");
        let err = cfg.apply_env_from(|k| (k == "AUTHZ_PRECOMPILE").then(|| "perhaps".to_string())).unwrap_err();
        assert_eq!(err.code_str(), "config_error");
    }

    #[test]
    fn precompile_rejects_bad_catalog_at_build() {
        let catalog = Arc::new(RuleCatalog::builder().method("/s/m", ["user.roles &&"]).build().unwrap());
        let cfg = AuthorizerConfig::default();
        let err = cfg.build(catalog.clone(), Arc::new(crate::identity::NoIdentity)).unwrap_err();
        assert_eq!(err.code_str(), "compile_error");
        let lazy = AuthorizerConfig { precompile: false, ..Default::default() };
        assert!(lazy.build(catalog, Arc::new(crate::identity::NoIdentity)).is_ok());
    }
}
