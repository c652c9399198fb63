//! Common Expression Language backend.
//!
//! Programs are parsed once and shared freely between threads; each execution
//! builds its own `Context` from the evaluation context. CEL has no loops, so an
//! execution is bounded by the size of the expression and its inputs.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use cel_interpreter::{objects::Map, Context, Program, Value};
use cel_parser::ast::{EntryExpr, Expr, IdedEntryExpr, IdedExpr};
use cel_parser::Parser;

use super::{Backend, Evaluator};
use crate::context::{EvaluationContext, ExpressionVar};
use crate::error::{AuthzError, AuthzResult};

/// A parsed CEL expression.
pub struct CelProgram {
    program: Program,
}

impl std::fmt::Debug for CelProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelProgram").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CelEvaluator {
    _priv: (),
}

impl CelEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Evaluator for CelEvaluator {
    type Program = CelProgram;

    fn backend(&self) -> Backend {
        Backend::Cel
    }

    fn compile(&self, expression: &str) -> AuthzResult<CelProgram> {
        let (ast, program) = parse_guarded(expression)?;
        let mut scope = Vec::new();
        if let Some(name) = first_unbound(&ast, &mut scope) {
            return Err(AuthzError::compile(expression, format!("undeclared reference to '{}'", name)));
        }
        Ok(CelProgram { program })
    }

    fn execute(&self, program: &CelProgram, expression: &str, ctx: &EvaluationContext) -> AuthzResult<bool> {
        if ctx.deadline_passed() {
            return Err(AuthzError::DeadlineExceeded { expression: expression.to_string() });
        }
        let context = build_cel_context(ctx);
        match program.program.execute(&context).map_err(|e| AuthzError::evaluation(expression, e))? {
            Value::Bool(b) => Ok(b),
            other => Err(AuthzError::NonBoolean { expression: expression.to_string(), got: format!("{:?}", other) }),
        }
    }
}

/// Parse into both the raw AST (for scope checks) and an executable program.
/// The generated parser can panic on some malformed input rather than report
/// an error, so the panic is caught and surfaced as a compile error.
fn parse_guarded(expression: &str) -> AuthzResult<(IdedExpr, Program)> {
    let parsed = panic::catch_unwind(AssertUnwindSafe(|| {
        let ast = Parser::new().parse(expression)?;
        let program = Program::compile(expression)?;
        Ok::<_, cel_interpreter::ParseErrors>((ast, program))
    }));
    match parsed {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(e)) => Err(AuthzError::compile(expression, e)),
        Err(payload) => Err(AuthzError::compile(expression, format!("parse failed: {}", panic_message(&payload)))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "malformed expression".to_string()
    }
}

/// First identifier that is neither a declared variable nor bound by an
/// enclosing comprehension at the point it is used.
fn first_unbound<'a>(node: &'a IdedExpr, scope: &mut Vec<&'a str>) -> Option<&'a str> {
    match &node.expr {
        Expr::Ident(name) => {
            let bound = ExpressionVar::is_declared(name) || scope.iter().any(|s| *s == name.as_str());
            (!bound).then_some(name.as_str())
        }
        Expr::Unspecified | Expr::Literal(_) => None,
        Expr::Select(sel) => first_unbound(&sel.operand, scope),
        Expr::Call(call) => {
            if let Some(target) = &call.target {
                if let Some(name) = first_unbound(target, scope) {
                    return Some(name);
                }
            }
            call.args.iter().find_map(|arg| first_unbound(arg, scope))
        }
        Expr::List(list) => list.elements.iter().find_map(|e| first_unbound(e, scope)),
        Expr::Map(map) => map.entries.iter().find_map(|e| entry_unbound(e, scope)),
        Expr::Struct(st) => st.entries.iter().find_map(|e| entry_unbound(e, scope)),
        Expr::Comprehension(c) => {
            if let Some(name) = first_unbound(&c.iter_range, scope).or_else(|| first_unbound(&c.accu_init, scope)) {
                return Some(name);
            }
            let depth = scope.len();
            scope.push(c.accu_var.as_str());
            // result sees only the accumulator
            let found = first_unbound(&c.result, scope);
            scope.push(c.iter_var.as_str());
            if let Some(v2) = &c.iter_var2 {
                scope.push(v2.as_str());
            }
            let found = found
                .or_else(|| first_unbound(&c.loop_cond, scope))
                .or_else(|| first_unbound(&c.loop_step, scope));
            scope.truncate(depth);
            found
        }
    }
}

fn entry_unbound<'a>(entry: &'a IdedEntryExpr, scope: &mut Vec<&'a str>) -> Option<&'a str> {
    match &entry.expr {
        EntryExpr::StructField(f) => first_unbound(&f.value, scope),
        EntryExpr::MapEntry(m) => first_unbound(&m.key, scope).or_else(|| first_unbound(&m.value, scope)),
    }
}

fn build_cel_context(ctx: &EvaluationContext) -> Context<'_> {
    let mut context = Context::default();

    let metadata: HashMap<Arc<String>, Value> = ctx
        .metadata
        .iter()
        .map(|(k, v)| (Arc::new(k.clone()), Value::String(Arc::new(v.clone()))))
        .collect();

    context.add_variable_from_value(ExpressionVar::Metadata.as_str(), Value::Map(Map::from(metadata)));
    context.add_variable_from_value(ExpressionVar::Request.as_str(), json_to_cel(ctx.request_value()));
    context.add_variable_from_value(ExpressionVar::User.as_str(), json_to_cel(&ctx.user));
    context.add_variable_from_value(ExpressionVar::IsStream.as_str(), Value::Bool(ctx.is_stream));
    context.add_variable_from_value(ExpressionVar::Method.as_str(), Value::String(Arc::new(ctx.method.clone())));
    context
}

/// Convert a structured JSON value into a CEL value; objects become string-keyed maps.
fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => Value::List(Arc::new(items.iter().map(json_to_cel).collect())),
        serde_json::Value::Object(fields) => {
            let map: HashMap<Arc<String>, Value> =
                fields.iter().map(|(k, v)| (Arc::new(k.clone()), json_to_cel(v))).collect();
            Value::Map(Map::from(map))
        }
    }
}
