//! End-to-end interceptor tests: whitelist, selectors, identity failures,
//! unary and streaming adapters, chained backends and config wiring.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};

use rpc_authorizer::{
    Authorize, AuthorizerChain, AuthorizerConfig, AuthzError, CallInfo, CelEvaluator, DecisionReason, HeaderIdentity,
    IdentityExtractor, Interceptor, LuaEvaluator, Metadata, RuleAuthorizer, RuleCatalog, Selector, Whitelist,
};

fn catalog() -> Arc<RuleCatalog> {
    Arc::new(
        RuleCatalog::builder()
            .method("/example.ExampleService/RequestMatch", ["'admin' in user.roles && request.AccountId == '8'"])
            .method("/example.ExampleService/Stream", ["is_stream && request == null"])
            .method("/grpc.health.v1.Health/Check", ["false"])
            .build()
            .unwrap(),
    )
}

fn failing_extractor(calls: Arc<AtomicUsize>) -> Arc<dyn IdentityExtractor> {
    Arc::new(move |_call: &CallInfo| -> Result<Value> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("token expired"))
    })
}

fn admin_extractor() -> Arc<dyn IdentityExtractor> {
    Arc::new(|_call: &CallInfo| -> Result<Value> { Ok(json!({"roles": ["admin"]})) })
}

#[derive(Serialize)]
#[allow(non_snake_case)]
struct RequestMatch {
    AccountId: String,
}

#[test]
fn whitelist_bypasses_identity_and_rules() {
    let calls = Arc::new(AtomicUsize::new(0));
    let i = Interceptor::new(Arc::new(RuleAuthorizer::new(catalog(), CelEvaluator::new())))
        .with_whitelist(Whitelist::new(["/grpc.health.v1.Health/Check"]))
        .with_extractor(failing_extractor(calls.clone()));

    let d = i.check(&CallInfo::new("/grpc.health.v1.Health/Check", Metadata::new()), None, false).unwrap();
    assert!(d.allow);
    assert_eq!(d.reason, DecisionReason::Whitelisted);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let err = i
        .check(&CallInfo::new("/example.ExampleService/RequestMatch", Metadata::new()), None, false)
        .unwrap_err();
    assert_eq!(err.code_str(), "identity_error");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn unselected_calls_pass_through() {
    let calls = Arc::new(AtomicUsize::new(0));
    let i = Interceptor::new(Arc::new(RuleAuthorizer::new(catalog(), CelEvaluator::new())))
        .with_selectors(vec![Selector::MetadataPresent("authorization".into())])
        .with_extractor(failing_extractor(calls.clone()));

    let d = i.check(&CallInfo::new("/example.ExampleService/RequestMatch", Metadata::new()), None, false).unwrap();
    assert_eq!(d.reason, DecisionReason::NotSelected);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let selected = CallInfo::new("/example.ExampleService/RequestMatch", Metadata::new().with("authorization", "Bearer x"));
    assert!(i.check(&selected, None, false).is_err());
}

#[tokio::test]
async fn unary_passes_original_request_to_handler() {
    let i = Interceptor::new(Arc::new(RuleAuthorizer::new(catalog(), CelEvaluator::new())))
        .with_extractor(admin_extractor());
    let call = CallInfo::new("/example.ExampleService/RequestMatch", Metadata::new());

    let out: Result<String, AuthzError> = i
        .unary(&call, RequestMatch { AccountId: "8".into() }, |req| async move { Ok(format!("hello {}", req.AccountId)) })
        .await;
    assert_eq!(out.unwrap(), "hello 8");

    let out: Result<String, AuthzError> =
        i.unary(&call, RequestMatch { AccountId: "9".into() }, |_| async { Ok(String::new()) }).await;
    let err = out.unwrap_err();
    assert!(err.is_denial());
    assert_eq!(err.grpc_code(), 7);
}

#[tokio::test]
async fn stream_handler_runs_only_when_allowed() {
    let i = Interceptor::new(Arc::new(RuleAuthorizer::new(catalog(), CelEvaluator::new())))
        .with_extractor(admin_extractor());
    let ran = Arc::new(AtomicUsize::new(0));

    let r = ran.clone();
    let ok: Result<(), AuthzError> = i
        .stream(&CallInfo::new("/example.ExampleService/Stream", Metadata::new()), || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(ok.is_ok());

    let r = ran.clone();
    let denied: Result<(), AuthzError> = i
        .stream(&CallInfo::new("/other.Service/Stream", Metadata::new()), || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(denied.unwrap_err().is_denial());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn chain_of_backends_is_an_or() {
    let cel_catalog =
        Arc::new(RuleCatalog::builder().method("/s.S/M", ["'admin' in user.roles"]).build().unwrap());
    let lua_catalog =
        Arc::new(RuleCatalog::builder().method("/s.S/M", ["contains(user.roles, 'auditor')"]).build().unwrap());
    let chain = AuthorizerChain::new()
        .with(Arc::new(RuleAuthorizer::new(cel_catalog, CelEvaluator::new())))
        .with(Arc::new(RuleAuthorizer::new(lua_catalog, LuaEvaluator::new().unwrap())));
    let i = Interceptor::new(Arc::new(chain)).with_extractor(Arc::new(HeaderIdentity::default()));

    let call = |roles: &str| {
        CallInfo::new("/s.S/M", Metadata::new().with("x-user-id", "u1").with("x-user-roles", roles))
    };
    assert!(i.check(&call("admin"), None, false).unwrap().allow);
    assert!(i.check(&call("auditor"), None, false).unwrap().allow);
    assert!(!i.check(&call("guest"), None, false).unwrap().allow);
}

#[test]
fn config_file_builds_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("authz.json");
    std::fs::write(
        &path,
        r#"{
            "backend": "lua",
            "whitelist": ["/grpc.health.v1.Health/Check"],
            "fallback": "deny",
            "lua": {"pool_size": 2, "eval_timeout_ms": 50}
        }"#,
    )
    .unwrap();
    let cfg = AuthorizerConfig::from_file(&path).unwrap();
    let lua_catalog = Arc::new(
        RuleCatalog::builder()
            .method("/s.S/Known", ["contains(user.roles, 'admin')"])
            .method("/grpc.health.v1.Health/Check", ["false"])
            .build()
            .unwrap(),
    );
    let i = cfg.build(lua_catalog, admin_extractor()).unwrap();

    assert!(i.check(&CallInfo::new("/s.S/Known", Metadata::new()), None, false).unwrap().allow);
    assert!(i.check(&CallInfo::new("/grpc.health.v1.Health/Check", Metadata::new()), None, false).unwrap().allow);
    // fallback is deny, so the sibling does not cover this one
    let d = i.check(&CallInfo::new("/s.S/Unknown", Metadata::new()), None, false).unwrap();
    assert_eq!(d.reason, DecisionReason::UnknownMethod);
    // both catalog expressions were compiled up front
    assert_eq!(i.authorizer().cache_stats().unwrap().compiles, 2);
}

#[tokio::test]
async fn concurrent_unary_calls_share_one_program() {
    let authz = Arc::new(RuleAuthorizer::new(catalog(), CelEvaluator::new()));
    let i = Interceptor::new(authz.clone()).with_extractor(admin_extractor());
    let call = CallInfo::new("/example.ExampleService/RequestMatch", Metadata::new());
    let calls = (0..32).map(|n| {
        let account = if n % 2 == 0 { "8" } else { "9" };
        i.unary(&call, RequestMatch { AccountId: account.into() }, |_| async { Ok::<_, AuthzError>(()) })
    });
    let results = futures::future::join_all(calls).await;
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 16);
    assert_eq!(authz.cache_stats().unwrap().compiles, 1);
}
