//! Lua decision tests, mirroring the CEL scenarios with Lua expressions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use rpc_authorizer::identity::to_user_value;
use rpc_authorizer::{
    Authorize, DecisionReason, EvaluationContext, LuaEvaluator, LuaOptions, Metadata, RuleAuthorizer, RuleCatalog,
};

fn example_catalog() -> Arc<RuleCatalog> {
    Arc::new(
        RuleCatalog::builder()
            .method("/example.ExampleService/AllowAll", ["*"])
            .method(
                "/example.ExampleService/RequestMatch",
                ["contains(user.AccountIds, request.AccountId) and contains(user.Roles, 'admin')", "user.IsSuperAdmin"],
            )
            .method(
                "/example.ExampleService/MetadataMatch",
                ["contains(user.AccountIds, metadata['x-account-id']) and contains(user.Roles, 'admin')", "user.IsSuperAdmin"],
            )
            .method("/example.ExampleService/Stream", ["is_stream and request == nil"])
            .build()
            .unwrap(),
    )
}

fn authorizer() -> RuleAuthorizer<LuaEvaluator> {
    RuleAuthorizer::new(example_catalog(), LuaEvaluator::new().unwrap())
}

fn test_user() -> Value {
    json!({
        "Id": "123",
        "Email": "someone@example.com",
        "AccountIds": ["940298", "123123"],
        "Roles": ["admin", "user"],
        "IsSuperAdmin": false
    })
}

#[test]
fn request_match() {
    let authz = authorizer();
    let allowed = EvaluationContext::build(
        test_user(),
        Some(json!({"AccountId": "940298"})),
        &Metadata::new(),
        false,
        "/example.ExampleService/RequestMatch",
    );
    assert_eq!(authz.authorize(&allowed).unwrap().reason, DecisionReason::Rule(0));

    let denied = EvaluationContext::build(
        test_user(),
        Some(json!({"AccountId": "1"})),
        &Metadata::new(),
        false,
        "/example.ExampleService/RequestMatch",
    );
    assert!(!authz.authorize(&denied).unwrap().allow);
}

#[test]
fn metadata_match() {
    let authz = authorizer();
    let ctx = EvaluationContext::build(
        test_user(),
        None,
        &Metadata::new().with("x-account-id", "123123"),
        false,
        "/example.ExampleService/MetadataMatch",
    );
    assert!(authz.authorize(&ctx).unwrap().allow);
}

#[test]
fn stream_has_no_request() {
    let authz = authorizer();
    let ctx = EvaluationContext::build(
        test_user(),
        Some(json!({"AccountId": "940298"})),
        &Metadata::new(),
        true,
        "/example.ExampleService/Stream",
    );
    assert!(authz.authorize(&ctx).unwrap().allow);
}

#[test]
fn allow_all_and_sibling_fallback() {
    let authz = authorizer();
    let ctx = |m: &str| EvaluationContext::build(Value::Null, None, &Metadata::new(), false, m);
    assert_eq!(authz.authorize(&ctx("/example.ExampleService/AllowAll")).unwrap().reason, DecisionReason::AllowAll);
    assert_eq!(
        authz.authorize(&ctx("/example.ExampleService/NotListed")).unwrap().reason,
        DecisionReason::ServiceCovered
    );
    assert!(!authz.authorize(&ctx("/unknown.Service/Call")).unwrap().allow);
}

#[test]
fn non_boolean_rule_aborts() {
    let catalog = Arc::new(RuleCatalog::builder().method("/s/m", ["user.Id", "true"]).build().unwrap());
    let authz = RuleAuthorizer::new(catalog, LuaEvaluator::new().unwrap());
    let ctx = EvaluationContext::build(test_user(), None, &Metadata::new(), false, "/s/m");
    let err = authz.authorize(&ctx).unwrap_err();
    assert_eq!(err.code_str(), "non_boolean_result");
    assert!(!err.is_denial());
}

#[test]
fn builtins_feed_rules() {
    let mut builtins = BTreeMap::new();
    builtins.insert("allowed_tenants".to_string(), json!(["acme", "globex"]));
    let lua = LuaEvaluator::with_options(LuaOptions { builtins, ..Default::default() }).unwrap();
    let catalog =
        Arc::new(RuleCatalog::builder().method("/s/m", ["contains(allowed_tenants, metadata['x-tenant'])"]).build().unwrap());
    let authz = RuleAuthorizer::new(catalog, lua);
    let ok = EvaluationContext::build(Value::Null, None, &Metadata::new().with("x-tenant", "acme"), false, "/s/m");
    let bad = EvaluationContext::build(Value::Null, None, &Metadata::new().with("x-tenant", "initech"), false, "/s/m");
    assert!(authz.authorize(&ok).unwrap().allow);
    assert!(!authz.authorize(&bad).unwrap().allow);
}

#[test]
fn runaway_rule_is_stopped() {
    let lua = LuaEvaluator::with_options(LuaOptions {
        eval_timeout: Some(Duration::from_millis(25)),
        ..Default::default()
    })
    .unwrap();
    let catalog = Arc::new(
        RuleCatalog::builder().method("/s/m", ["(function() while true do end end)()"]).build().unwrap(),
    );
    let authz = RuleAuthorizer::new(catalog, lua);
    let ctx = EvaluationContext::build(Value::Null, None, &Metadata::new(), false, "/s/m");
    let err = authz.authorize(&ctx).unwrap_err();
    assert_eq!(err.code_str(), "deadline_exceeded");
}

#[derive(Default, Serialize)]
#[allow(non_snake_case)]
struct Identity {
    Roles: Vec<String>,
    Accounts: Vec<String>,
    IsSuperAdmin: bool,
}

#[test]
fn admin_identity_is_allowed_and_guest_is_denied() {
    let catalog = Arc::new(
        RuleCatalog::builder()
            .method("/s.S/M", ["contains(user.Roles, 'admin') and contains(user.Accounts, request.AccountId)", "user.IsSuperAdmin"])
            .build()
            .unwrap(),
    );
    let authz = RuleAuthorizer::new(catalog, LuaEvaluator::new().unwrap());
    let call = |user: &Identity| {
        EvaluationContext::build(to_user_value(user).unwrap(), Some(json!({"AccountId": "8"})), &Metadata::new(), false, "/s.S/M")
    };

    let admin = Identity { Roles: vec!["admin".into()], Accounts: vec!["8".into()], ..Default::default() };
    assert_eq!(authz.authorize(&call(&admin)).unwrap().reason, DecisionReason::Rule(0));

    let guest = Identity { Roles: vec!["guest".into()], ..Default::default() };
    let d = authz.authorize(&call(&guest)).unwrap();
    assert!(!d.allow);
    assert_eq!(d.reason, DecisionReason::NoRuleMatched);

    // an untyped user without the flag yields nil, which is not a boolean
    let untyped = EvaluationContext::build(json!({"Roles": ["guest"]}), Some(json!({"AccountId": "8"})), &Metadata::new(), false, "/s.S/M");
    assert_eq!(authz.authorize(&untyped).unwrap_err().code_str(), "non_boolean_result");
}
