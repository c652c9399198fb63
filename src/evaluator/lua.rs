//! Lua backend.
//!
//! An expression is compiled once to bytecode (`return (<expr>)`, or the text as
//! a chunk when it already contains its own `return`). Lua states cannot run one
//! program from several threads at once, so executions borrow a state from a
//! bounded pool and run the bytecode against a fresh environment table holding
//! the call's variables. Whatever a rule assigns lands in that table and is
//! dropped with it, so nothing written by one call is visible to the next.
//!
//! Names not bound for the call resolve through a per-state sandbox: a fixed set
//! of base functions, read-only views of `string`, `table` and `math`, the
//! `contains` helper and the configured builtins. Reading any other name raises
//! an error instead of yielding `nil`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, StdLib, Table, Value as LVal};
use regex::Regex;
use tracing::debug;

use super::pool::Pool;
use super::{Backend, Evaluator};
use crate::context::{EvaluationContext, ExpressionVar};
use crate::error::{AuthzError, AuthzResult};

#[derive(Debug, Clone)]
pub struct LuaOptions {
    /// Upper bound on live Lua states.
    pub pool_size: usize,
    /// Per-evaluation budget, applied in addition to the call deadline.
    pub eval_timeout: Option<Duration>,
    /// How many VM instructions run between two deadline checks.
    pub instruction_check_interval: u32,
    /// Constant globals injected into every state.
    pub builtins: BTreeMap<String, serde_json::Value>,
}

impl Default for LuaOptions {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            eval_timeout: Some(Duration::from_millis(100)),
            instruction_check_interval: 1000,
            builtins: BTreeMap::new(),
        }
    }
}

/// Bytecode for one expression; loadable into any pooled state.
#[derive(Debug, Clone)]
pub struct LuaProgram {
    bytecode: Vec<u8>,
}

impl LuaProgram {
    pub fn len(&self) -> usize {
        self.bytecode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }
}

pub struct LuaEvaluator {
    pool: Pool<Lua>,
    eval_timeout: Option<Duration>,
    check_interval: u32,
}

impl std::fmt::Debug for LuaEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaEvaluator")
            .field("pool", &self.pool)
            .field("eval_timeout", &self.eval_timeout)
            .finish()
    }
}

impl LuaEvaluator {
    pub fn new() -> AuthzResult<Self> {
        Self::with_options(LuaOptions::default())
    }

    pub fn with_options(options: LuaOptions) -> AuthzResult<Self> {
        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| AuthzError::Config(e.to_string()))?;
        for name in options.builtins.keys() {
            if !ident.is_match(name) {
                return Err(AuthzError::Config(format!("lua builtin '{}' is not a valid identifier", name)));
            }
            if ExpressionVar::is_declared(name) || name == "contains" {
                return Err(AuthzError::Config(format!("lua builtin '{}' shadows a reserved name", name)));
            }
        }
        let builtins = Arc::new(options.builtins);
        let prelude = Arc::new(prelude(&builtins));
        // Build one state eagerly so a broken prelude or builtin fails at construction
        drop(new_state(&builtins, &prelude)?);
        let pool = Pool::new(options.pool_size, move || new_state(&builtins, &prelude));
        Ok(Self {
            pool,
            eval_timeout: options.eval_timeout,
            check_interval: options.instruction_check_interval.max(1),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool.capacity()
    }

    /// States created so far.
    pub fn states_created(&self) -> usize {
        self.pool.created()
    }

    fn effective_deadline(&self, call_deadline: Option<Instant>) -> Option<Instant> {
        let budget = self.eval_timeout.map(|t| Instant::now() + t);
        match (call_deadline, budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Evaluator for LuaEvaluator {
    type Program = LuaProgram;

    fn backend(&self) -> Backend {
        Backend::Lua
    }

    fn compile(&self, expression: &str) -> AuthzResult<LuaProgram> {
        let lua = Lua::new();
        let wrapped = format!("return ({})", expression);
        let func = match lua.load(&wrapped).set_name("=rule").into_function() {
            Ok(f) => f,
            Err(_) => lua
                .load(expression)
                .set_name("=rule")
                .into_function()
                .map_err(|e| AuthzError::compile(expression, e))?,
        };
        let bytecode = func.dump(false);
        // Validate quickly by reloading
        lua.load(bytecode.as_slice()).into_function().map_err(|e| AuthzError::compile(expression, e))?;
        debug!(target: "authz", "lua program compiled: {} bytes", bytecode.len());
        Ok(LuaProgram { bytecode })
    }

    fn execute(&self, program: &LuaProgram, expression: &str, ctx: &EvaluationContext) -> AuthzResult<bool> {
        if ctx.deadline_passed() {
            return Err(AuthzError::DeadlineExceeded { expression: expression.to_string() });
        }
        let deadline = self.effective_deadline(ctx.deadline);
        let vm = self.pool.acquire(ctx.deadline)?;
        let outcome = run_program(&vm, program, ctx, deadline, self.check_interval);
        if matches!(outcome, Err(mlua::Error::MemoryError(_))) {
            // an allocation failure can leave the state half-updated
            vm.discard();
        }
        match outcome {
            Ok(Ok(b)) => Ok(b),
            Ok(Err(got)) => Err(AuthzError::NonBoolean { expression: expression.to_string(), got }),
            Err(_) if deadline.is_some_and(|d| Instant::now() >= d) => {
                Err(AuthzError::DeadlineExceeded { expression: expression.to_string() })
            }
            Err(e) => Err(AuthzError::evaluation(expression, e)),
        }
    }
}

const ENV_METATABLE: &str = "authz.env_metatable";

/// Builds the sandbox and returns the metatable every call environment uses.
fn prelude(builtins: &BTreeMap<String, serde_json::Value>) -> String {
    let mut declared: Vec<String> = ExpressionVar::ALL.iter().map(|v| v.as_str().to_string()).collect();
    declared.extend(builtins.keys().cloned());
    let declared = declared.iter().map(|n| format!("{} = true", n)).collect::<Vec<_>>().join(", ");
    let builtin_names = builtins.keys().map(|n| format!("{:?}", n)).collect::<Vec<_>>().join(", ");
    format!(
        r#"
local declared = {{ {declared} }}
local builtin_names = {{ {builtin_names} }}

local function readonly(t)
  local wrapped = {{}}
  local proxy = {{}}
  setmetatable(proxy, {{
    __index = function(_, k)
      local v = t[k]
      if type(v) ~= "table" then return v end
      local w = wrapped[k]
      if w == nil then
        w = readonly(v)
        wrapped[k] = w
      end
      return w
    end,
    __newindex = function(_, k)
      error("attempt to modify read-only value '" .. tostring(k) .. "'", 2)
    end,
    __len = function() return #t end,
    __pairs = function()
      return function(_, k)
        local nk = next(t, k)
        if nk == nil then return nil end
        return nk, proxy[nk]
      end, proxy, nil
    end,
    __metatable = false,
  }})
  return proxy
end

local function contains(list, value)
  if type(list) ~= "table" then return false end
  for _, v in ipairs(list) do
    if v == value then return true end
  end
  return false
end

local sandbox = {{
  assert = assert, error = error, ipairs = ipairs, next = next, pairs = pairs,
  select = select, tonumber = tonumber, tostring = tostring, type = type,
  string = readonly(string), table = readonly(table), math = readonly(math),
  contains = contains,
}}
for _, name in ipairs(builtin_names) do
  local v = _G[name]
  if type(v) == "table" then v = readonly(v) end
  sandbox[name] = v
end

return {{
  __index = function(_, key)
    local v = sandbox[key]
    if v ~= nil then return v end
    if declared[key] then return nil end
    error("undeclared variable '" .. tostring(key) .. "'", 2)
  end,
  __metatable = false,
}}
"#
    )
}

fn new_state(builtins: &BTreeMap<String, serde_json::Value>, prelude: &str) -> AuthzResult<Lua> {
    let init = |lua: &Lua| -> mlua::Result<()> {
        let globals = lua.globals();
        for (name, value) in builtins.iter() {
            globals.set(name.as_str(), json_to_lua(lua, value)?)?;
        }
        let env_mt: Table = lua.load(prelude).set_name("=prelude").eval()?;
        lua.set_named_registry_value(ENV_METATABLE, env_mt)
    };
    let lua = Lua::new_with(StdLib::STRING | StdLib::TABLE | StdLib::MATH, mlua::LuaOptions::new())
        .map_err(|e| AuthzError::Config(format!("cannot create lua state: {}", e)))?;
    init(&lua).map_err(|e| AuthzError::Config(format!("cannot initialise lua state: {}", e)))?;
    Ok(lua)
}

/// Inner `Err(type_name)` means the program ran but returned a non-boolean.
fn run_program(
    lua: &Lua,
    program: &LuaProgram,
    ctx: &EvaluationContext,
    deadline: Option<Instant>,
    check_interval: u32,
) -> mlua::Result<Result<bool, String>> {
    let env = lua.create_table()?;
    env.set_metatable(Some(lua.named_registry_value::<Table>(ENV_METATABLE)?));
    env.raw_set(ExpressionVar::User.as_str(), json_to_lua(lua, &ctx.user)?)?;
    env.raw_set(ExpressionVar::Request.as_str(), json_to_lua(lua, ctx.request_value())?)?;
    let metadata = lua.create_table()?;
    for (k, v) in ctx.metadata.iter() {
        metadata.set(k.as_str(), v.as_str())?;
    }
    env.raw_set(ExpressionVar::Metadata.as_str(), metadata)?;
    env.raw_set(ExpressionVar::IsStream.as_str(), ctx.is_stream)?;
    env.raw_set(ExpressionVar::Method.as_str(), ctx.method.as_str())?;

    if let Some(d) = deadline {
        lua.set_hook(HookTriggers::new().every_nth_instruction(check_interval), move |_lua, _debug| {
            if Instant::now() >= d {
                return Err(mlua::Error::RuntimeError("evaluation deadline exceeded".into()));
            }
            Ok(())
        });
    }
    let result = lua
        .load(program.bytecode.as_slice())
        .set_name("=rule")
        .set_environment(env)
        .into_function()
        .and_then(|f| f.call::<_, LVal>(()));
    if deadline.is_some() {
        lua.remove_hook();
    }
    Ok(match result? {
        LVal::Boolean(b) => Ok(b),
        other => Err(other.type_name().to_string()),
    })
}

/// JSON to Lua: arrays become 1-based sequences, objects string-keyed tables, null is nil.
fn json_to_lua<'lua>(lua: &'lua Lua, v: &serde_json::Value) -> mlua::Result<LVal<'lua>> {
    let lv = match v {
        serde_json::Value::Null => LVal::Nil,
        serde_json::Value::Bool(b) => LVal::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() { LVal::Integer(i) } else { LVal::Number(n.as_f64().unwrap_or(0.0)) }
        }
        serde_json::Value::String(s) => LVal::String(lua.create_string(s)?),
        serde_json::Value::Array(arr) => {
            let tbl = lua.create_table()?;
            for (i, item) in arr.iter().enumerate() { tbl.set((i + 1) as i64, json_to_lua(lua, item)?)?; }
            LVal::Table(tbl)
        }
        serde_json::Value::Object(map) => {
            let tbl = lua.create_table()?;
            for (k, val) in map.iter() { tbl.set(k.as_str(), json_to_lua(lua, val)?)?; }
            LVal::Table(tbl)
        }
    };
    Ok(lv)
}
