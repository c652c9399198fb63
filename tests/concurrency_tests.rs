//! Many threads hitting a cold authorizer at once: every distinct expression is
//! compiled exactly once and all threads get the same decisions.

use std::sync::Arc;
use std::thread;

use serde_json::json;

use rpc_authorizer::{
    Authorize, CelEvaluator, EvaluationContext, Evaluator, LuaEvaluator, LuaOptions, Metadata, RuleAuthorizer,
    RuleCatalog,
};

fn catalog(exprs: [&str; 3]) -> Arc<RuleCatalog> {
    Arc::new(
        RuleCatalog::builder()
            .method("/svc.S/A", [exprs[0]])
            .method("/svc.S/B", [exprs[1], exprs[0]])
            .method("/svc.S/C", [exprs[2]])
            .build()
            .unwrap(),
    )
}

fn hammer<E: Evaluator>(authz: &RuleAuthorizer<E>) {
    let methods = ["/svc.S/A", "/svc.S/B", "/svc.S/C"];
    thread::scope(|scope| {
        for t in 0..12 {
            scope.spawn(move || {
                for i in 0..100 {
                    let admin = (t + i) % 2 == 0;
                    let method = methods[(t + i) % methods.len()];
                    let ctx = EvaluationContext::build(
                        json!({"admin": admin, "n": i}),
                        Some(json!({"n": i})),
                        &Metadata::new(),
                        false,
                        method,
                    );
                    let d = authz.authorize(&ctx).unwrap();
                    let expected = match method {
                        "/svc.S/C" => true,
                        _ => admin,
                    };
                    assert_eq!(d.allow, expected, "{} admin={}", method, admin);
                }
            });
        }
    });
}

#[test]
fn cel_cold_start_compiles_once_per_expression() {
    let authz = RuleAuthorizer::new(
        catalog(["user.admin == true", "user.admin == true && user.n >= 0", "request.n == user.n"]),
        CelEvaluator::new(),
    );
    hammer(&authz);
    let stats = authz.cache_stats().unwrap();
    assert_eq!(stats.compiles, 3);
    assert_eq!(stats.entries, 3);
}

#[test]
fn lua_cold_start_compiles_once_and_bounds_states() {
    let lua = LuaEvaluator::with_options(LuaOptions { pool_size: 4, ..Default::default() }).unwrap();
    let authz = RuleAuthorizer::new(
        catalog(["user.admin", "user.admin and user.n >= 0", "request.n == user.n"]),
        lua,
    );
    hammer(&authz);
    assert_eq!(authz.cache_stats().unwrap().compiles, 3);
    assert!(authz.engine().evaluator().states_created() <= 4);
}
