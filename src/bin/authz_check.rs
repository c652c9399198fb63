//!
//! authz_check
//! -----------
//! Operator tool for rule catalogs: validate that every expression compiles, or
//! dry-run one call through the full pipeline and print the decision.
//! Exit status: 0 allow/valid, 1 deny, 2 usage, 3 error.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use rpc_authorizer::identity::CallInfo;
use rpc_authorizer::{AuthorizerConfig, Backend, IdentityExtractor, Metadata, RuleCatalog};

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} --catalog <file> --validate [--backend cel|lua] [--config <file>]\n  {program} --catalog <file> --method <name> [--user <json>] [--request <json>] [--metadata k=v]... [--stream] [--backend cel|lua] [--config <file>]\n\nFlags:\n  --catalog <file>     Rule catalog JSON: {{\"/pkg.Service/Method\": {{\"rules\": [{{\"expression\": \"...\"}}]}}}}\n  --config <file>      Authorizer config JSON (AUTHZ_* environment variables still apply)\n  --backend <name>     Expression language, overrides config (cel or lua)\n  --validate           Compile every expression and report the first failure\n  --method <name>      Method identifier to authorize, e.g. /example.ExampleService/RequestMatch\n  --user <json>        User value bound as `user` (default null)\n  --request <json>     Request value bound as `request` (ignored with --stream)\n  --metadata k=v       Metadata entry; repeat for multiple values\n  --stream             Authorize as a streaming call\n  -h, --help           Show this help\n\nLogging: RUST_LOG=authz=debug"
    );
}

fn parse_json_arg(flag: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("{} is not valid JSON", flag))
}

struct Args {
    catalog: Option<PathBuf>,
    config: Option<PathBuf>,
    backend: Option<String>,
    validate: bool,
    method: Option<String>,
    user: Option<String>,
    request: Option<String>,
    metadata: Metadata,
    stream: bool,
}

fn parse_args(program: &str, args: &[String]) -> Args {
    let mut out = Args {
        catalog: None,
        config: None,
        backend: None,
        validate: false,
        method: None,
        user: None,
        request: None,
        metadata: Metadata::new(),
        stream: false,
    };
    let value = |i: usize, flag: &str| -> String {
        if i + 1 >= args.len() {
            eprintln!("{} requires a value", flag);
            print_usage(program);
            std::process::exit(2);
        }
        args[i + 1].clone()
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--catalog" => { out.catalog = Some(PathBuf::from(value(i, "--catalog"))); i += 2; continue; }
            "--config" => { out.config = Some(PathBuf::from(value(i, "--config"))); i += 2; continue; }
            "--backend" => { out.backend = Some(value(i, "--backend")); i += 2; continue; }
            "--method" => { out.method = Some(value(i, "--method")); i += 2; continue; }
            "--user" => { out.user = Some(value(i, "--user")); i += 2; continue; }
            "--request" => { out.request = Some(value(i, "--request")); i += 2; continue; }
            "--metadata" => {
                let kv = value(i, "--metadata");
                let Some((k, v)) = kv.split_once('=') else {
                    eprintln!("--metadata expects key=value, got '{}'", kv);
                    std::process::exit(2);
                };
                out.metadata.append(k.trim().to_ascii_lowercase(), v);
                i += 2; continue;
            }
            "--validate" => { out.validate = true; i += 1; continue; }
            "--stream" => { out.stream = true; i += 1; continue; }
            "-h" | "--help" => { print_usage(program); std::process::exit(0); }
            unk => {
                eprintln!("Unrecognized argument: {}", unk);
                print_usage(program);
                std::process::exit(2);
            }
        }
    }
    out
}

fn run(program: &str, args: Args) -> Result<i32> {
    let Some(catalog_path) = args.catalog else {
        eprintln!("--catalog is required");
        print_usage(program);
        return Ok(2);
    };
    let catalog = Arc::new(RuleCatalog::from_file(&catalog_path)?);

    let mut cfg = match &args.config {
        Some(p) => AuthorizerConfig::from_file(p)?,
        None => AuthorizerConfig::default(),
    };
    cfg.apply_env()?;
    if let Some(b) = &args.backend {
        cfg.backend = b.parse::<Backend>()?;
    }

    if args.validate {
        cfg.precompile = false;
        let authorizer = cfg.authorizer(catalog.clone())?;
        let n = authorizer.precompile()?;
        println!("{}: {} methods, {} distinct expressions compiled with {}", catalog_path.display(), catalog.len(), n, cfg.backend);
        return Ok(0);
    }

    let Some(method) = args.method else {
        eprintln!("either --validate or --method is required");
        print_usage(program);
        return Ok(2);
    };
    let user = match &args.user {
        Some(u) => parse_json_arg("--user", u)?,
        None => Value::Null,
    };
    let request = args.request.as_deref().map(|r| parse_json_arg("--request", r)).transpose()?;

    let extractor: Arc<dyn IdentityExtractor> = Arc::new(move |_call: &CallInfo| -> Result<Value> { Ok(user.clone()) });
    let interceptor = cfg.build(catalog, extractor)?;
    let call = CallInfo::new(method, args.metadata);
    let decision = interceptor.check(&call, request, args.stream)?;
    println!("{}", serde_json::to_string_pretty(&decision).map_err(|e| anyhow!(e))?);
    Ok(if decision.allow { 0 } else { 1 })
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let mut args: Vec<String> = env::args().collect();
    let program = if args.is_empty() { "authz_check".to_string() } else { args.remove(0) };
    let parsed = parse_args(&program, &args);
    let code = match run(&program, parsed) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            3
        }
    };
    std::process::exit(code);
}
