//! # SSR Engine
//!
//! Server-side rendering of compiled JavaScript bundles inside embedded V8
//! isolates, using deno_core.
//!
//! ## Guarantees
//!
//! - **Fresh isolate per render**: no global state leaks between renders
//! - **Hard deadlines**: a render that never yields (`while (true) {}`) is
//!   terminated by the engine when its deadline passes
//! - **Source-mapped errors**: stack frames point at the original sources
//! - **Captured console**: `console.*` output is returned with the result,
//!   never printed
//! - **No host access**: no filesystem, network, environment or `Deno`
//!   namespace inside the bundle
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ssr_engine::{RenderConfig, RenderRequest, RenderResult, RenderService};
//! use std::time::Duration;
//!
//! let service = RenderService::from_dir("./dist/ssr", RenderConfig::default())?;
//! let request = RenderRequest::new("entry-server.js", "render", r#"{"url": "/page"}"#)
//!     .with_max_duration(Duration::from_secs(2));
//!
//! match service.render(&request) {
//!     RenderResult::Success { markup, .. } => println!("{}", markup),
//!     RenderResult::Failure(failure) => eprintln!("{}: {}", failure.kind, failure.message),
//! }
//! # Ok::<(), ssr_engine::BundleLoadError>(())
//! ```

mod bundle;
mod config;
mod error;
mod ops;
pub mod platform;
mod props;
mod sandbox;
pub mod sourcemap;
mod service;
mod supervisor;

pub use bundle::{Bundle, BundleCache, BundleSource, DirectorySource, MemorySource, RawBundle};
pub use config::RenderConfig;
pub use error::{BundleLoadError, EngineError, ErrorKind, PropsError, SourceMapParseError};
pub use ops::{ConsoleLevel, ConsoleLine};
pub use props::parse_props;
pub use sandbox::{
    run_on_worker, EngineException, EngineOutcome, EngineResult, GeneratedFrame, Sandbox,
    SandboxLimits, BUNDLE_SCRIPT_NAME,
};
pub use service::{
    translate_frames, RenderFailure, RenderRequest, RenderResult, RenderService, StackFrame,
};
pub use sourcemap::{GeneratedPosition, OriginalPosition, SourceMap};
pub use supervisor::{Supervised, Supervisor, WorkerToken};
