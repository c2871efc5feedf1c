//! SSR Engine CLI
//!
//! Single-shot mode:
//!   ssr-engine [options] <bundle-dir> <bundle> [props-json]
//!
//! Server mode (persistent process, reads from stdin):
//!   ssr-engine [options] --server <bundle-dir>
//!
//! Options:
//!   --timeout-ms <n>     render deadline (default 30000)
//!   --max-heap-mb <n>    V8 heap ceiling per render, 0 = unlimited (default 64)
//!   --entrypoint <name>  dotted path of the render function (default: render)
//!
//! Protocol (server mode):
//!   Request (stdin), three lines:
//!     entry-server.js
//!     render
//!     {"page":"home","user":"Alice"}
//!
//!   A line `:invalidate <bundle>` (or `:invalidate *`) drops cached bundles.
//!   An empty entrypoint line uses `--entrypoint`.
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <!DOCTYPE html>...
//!
//!   Error response:
//!     Status:Error
//!     Kind:timeout
//!     Length:42
//!
//!     {"kind":"timeout","message":"Render timed out after 50ms",...}

use anyhow::{anyhow, bail, Context, Result};
use ssr_engine::{ConsoleLine, RenderConfig, RenderRequest, RenderResult, RenderService};
use std::io::{BufRead, Write};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_ENTRYPOINT: &str = "render";

fn print_usage() {
    eprintln!("SSR Engine - server-side rendering with hard deadlines");
    eprintln!();
    eprintln!("Single-shot mode:");
    eprintln!("  ssr-engine [options] <bundle-dir> <bundle> [props-json]");
    eprintln!();
    eprintln!("Server mode (persistent process):");
    eprintln!("  ssr-engine [options] --server <bundle-dir>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --timeout-ms <n>     render deadline in milliseconds (default 30000)");
    eprintln!("  --max-heap-mb <n>    heap ceiling per render, 0 = unlimited (default 64)");
    eprintln!("  --entrypoint <name>  render function path on globalThis (default render)");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  ssr-engine ./dist/ssr entry-server.js '{{\"page\":\"home\"}}'");
    eprintln!("  ssr-engine --timeout-ms 2000 --server ./dist/ssr");
}

struct Args {
    server: bool,
    entrypoint: String,
    config: RenderConfig,
    positional: Vec<String>,
}

fn parse_args(raw: impl Iterator<Item = String>) -> Result<Args> {
    let mut args = Args {
        server: false,
        entrypoint: DEFAULT_ENTRYPOINT.to_string(),
        config: RenderConfig::default(),
        positional: Vec::new(),
    };

    let mut raw = raw;
    while let Some(arg) = raw.next() {
        let mut value = |flag: &str| raw.next().ok_or_else(|| anyhow!("{} requires a value", flag));
        match arg.as_str() {
            "--server" => args.server = true,
            "--timeout-ms" => {
                let ms: u64 = value("--timeout-ms")?
                    .parse()
                    .context("--timeout-ms must be a whole number")?;
                args.config.default_timeout = Duration::from_millis(ms);
            }
            "--max-heap-mb" => {
                let mb: usize = value("--max-heap-mb")?
                    .parse()
                    .context("--max-heap-mb must be a whole number")?;
                args.config.max_heap_size = (mb > 0).then(|| mb * 1024 * 1024);
            }
            "--entrypoint" => args.entrypoint = value("--entrypoint")?,
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            other => args.positional.push(other.to_string()),
        }
    }

    Ok(args)
}

fn print_console(lines: &[ConsoleLine]) {
    for line in lines {
        eprintln!("[{}] {}", line.level.label(), line.message);
    }
}

/// Run in single-shot mode
fn run_single_shot(args: &Args) -> Result<()> {
    let (bundle_dir, bundle) = match args.positional.as_slice() {
        [dir, bundle] | [dir, bundle, _] => (dir, bundle),
        _ => {
            print_usage();
            bail!("Missing required arguments");
        }
    };
    let props_json = args.positional.get(2).map(String::as_str).unwrap_or("");

    let service = RenderService::from_dir(bundle_dir, args.config.clone())?;
    let result = service.render(&RenderRequest::new(
        bundle.as_str(),
        args.entrypoint.as_str(),
        props_json,
    ));

    // Console output goes to stderr, markup to stdout
    print_console(result.logs());

    match result {
        RenderResult::Success { markup, .. } => {
            println!("{}", markup);
            Ok(())
        }
        RenderResult::Failure(failure) => {
            for frame in &failure.frames {
                eprintln!(
                    "    at {} ({}:{}:{})",
                    frame.function_name.as_deref().unwrap_or("<anonymous>"),
                    frame.file.as_deref().unwrap_or("<unknown>"),
                    frame.line.unwrap_or(0),
                    frame.column.unwrap_or(0),
                );
            }
            Err(anyhow!("{}: {}", failure.kind, failure.message))
        }
    }
}

/// Run in server mode (persistent process, reads requests from stdin)
fn run_server(args: &Args) -> Result<()> {
    let bundle_dir = match args.positional.as_slice() {
        [dir] => dir,
        _ => {
            print_usage();
            bail!("Server mode requires bundle-dir argument");
        }
    };

    // V8 platform and bundle directory are set up once at startup
    let service = RenderService::from_dir(bundle_dir, args.config.clone())?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!(bundle_dir = %bundle_dir, "server ready, reading from stdin");

    loop {
        let mut bundle_line = String::new();
        if reader.read_line(&mut bundle_line)? == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let bundle = bundle_line.trim();

        if let Some(target) = bundle.strip_prefix(":invalidate") {
            match target.trim() {
                "*" | "" => service.cache().invalidate_all(),
                id => {
                    service.cache().invalidate(id);
                }
            }
            write_ok(&mut stdout, "")?;
            continue;
        }

        let mut entry_line = String::new();
        let mut props_line = String::new();
        reader.read_line(&mut entry_line)?;
        reader.read_line(&mut props_line)?;

        let entrypoint = match entry_line.trim() {
            "" => args.entrypoint.as_str(),
            name => name,
        };

        let result = service.render(&RenderRequest::new(bundle, entrypoint, props_line.trim()));
        print_console(result.logs());
        write_response(&mut stdout, &result)?;

        service.supervisor().reap();
    }

    tracing::info!("server shutting down");
    Ok(())
}

fn write_ok(stdout: &mut std::io::Stdout, body: &str) -> Result<()> {
    writeln!(stdout, "Status:Ok")?;
    write_body(stdout, body)
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, result: &RenderResult) -> Result<()> {
    match result {
        RenderResult::Success { markup, .. } => write_ok(stdout, markup),
        RenderResult::Failure(failure) => {
            let body = serde_json::to_string(failure)?;
            writeln!(stdout, "Status:Error")?;
            writeln!(stdout, "Kind:{}", failure.kind)?;
            write_body(stdout, &body)
        }
    }
}

fn write_body(stdout: &mut std::io::Stdout, body: &str) -> Result<()> {
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    if args.server {
        run_server(&args)
    } else {
        run_single_shot(&args)
    }
}
