//! Render service - the public entry point.
//!
//! Orchestration only: resolve the bundle, run the sandbox under a deadline
//! on a fresh worker, translate stack frames through the bundle's source
//! map, and normalize everything into a [`RenderResult`]. No retries.

use crate::bundle::{Bundle, BundleCache, BundleSource, DirectorySource};
use crate::config::RenderConfig;
use crate::error::{BundleLoadError, EngineError, ErrorKind};
use crate::ops::ConsoleLine;
use crate::platform;
use crate::props::parse_props;
use crate::sandbox::{
    run_on_worker, EngineOutcome, GeneratedFrame, BOOTSTRAP_SCRIPT_NAME, BUNDLE_SCRIPT_NAME,
    RENDER_SCRIPT_NAME,
};
use crate::sourcemap::GeneratedPosition;
use crate::supervisor::{Supervised, Supervisor};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One render call.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Bundle identifier understood by the [`BundleSource`].
    pub bundle: String,
    /// Dotted path of the render function on `globalThis`.
    pub entrypoint: String,
    /// Props as JSON text. Empty text means `{}`.
    pub props_json: String,
    /// Deadline; falls back to [`RenderConfig::default_timeout`].
    pub max_duration: Option<Duration>,
}

impl RenderRequest {
    pub fn new(
        bundle: impl Into<String>,
        entrypoint: impl Into<String>,
        props_json: impl Into<String>,
    ) -> Self {
        Self {
            bundle: bundle.into(),
            entrypoint: entrypoint.into(),
            props_json: props_json.into(),
            max_duration: None,
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }
}

/// A stack frame after source map translation. One-based line and column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// False when the frame still points into generated code.
    pub mapped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub frames: Vec<StackFrame>,
    /// Console lines emitted before the failure. Always empty on timeout.
    pub logs: Vec<ConsoleLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl RenderFailure {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
            logs: Vec::new(),
            elapsed_ms: None,
        }
    }
}

/// Outcome of a render, always returned as data.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RenderResult {
    Success {
        markup: String,
        logs: Vec<ConsoleLine>,
    },
    Failure(RenderFailure),
}

impl RenderResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RenderResult::Success { .. })
    }

    pub fn markup(&self) -> Option<&str> {
        match self {
            RenderResult::Success { markup, .. } => Some(markup),
            RenderResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RenderFailure> {
        match self {
            RenderResult::Failure(failure) => Some(failure),
            RenderResult::Success { .. } => None,
        }
    }

    pub fn logs(&self) -> &[ConsoleLine] {
        match self {
            RenderResult::Success { logs, .. } => logs,
            RenderResult::Failure(failure) => &failure.logs,
        }
    }
}

impl From<RenderFailure> for RenderResult {
    fn from(failure: RenderFailure) -> Self {
        RenderResult::Failure(failure)
    }
}

/// Renders bundles. Safe to share across threads; every render runs on its
/// own worker with its own isolate.
pub struct RenderService {
    cache: BundleCache,
    supervisor: Supervisor,
    config: RenderConfig,
}

impl RenderService {
    pub fn new(source: impl BundleSource + 'static, config: RenderConfig) -> Self {
        platform::initialize();
        Self {
            cache: BundleCache::new(source),
            supervisor: Supervisor::new(),
            config,
        }
    }

    /// Serve bundles from a build output directory.
    pub fn from_dir(dir: impl AsRef<Path>, config: RenderConfig) -> Result<Self, BundleLoadError> {
        Ok(Self::new(DirectorySource::new(dir)?, config))
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn render(&self, request: &RenderRequest) -> RenderResult {
        let started = Instant::now();
        let result = self.render_inner(request);

        match &result {
            RenderResult::Success { .. } => tracing::debug!(
                bundle = %request.bundle,
                entrypoint = %request.entrypoint,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render succeeded"
            ),
            RenderResult::Failure(failure) => tracing::debug!(
                bundle = %request.bundle,
                entrypoint = %request.entrypoint,
                elapsed_ms = started.elapsed().as_millis() as u64,
                kind = %failure.kind,
                "render failed"
            ),
        }
        result
    }

    fn render_inner(&self, request: &RenderRequest) -> RenderResult {
        let bundle = match self.cache.get_or_load(&request.bundle) {
            Ok(bundle) => bundle,
            Err(e) => return RenderFailure::new(ErrorKind::BundleLoad, e.to_string()).into(),
        };

        let props = match parse_props(&request.props_json) {
            Ok(props) => props,
            Err(e) => return RenderFailure::new(ErrorKind::Serialization, e.to_string()).into(),
        };

        let max_duration = request.max_duration.unwrap_or(self.config.default_timeout);
        let limits = self.config.sandbox_limits();
        let worker_bundle = Arc::clone(&bundle);
        let entrypoint = request.entrypoint.clone();

        let supervised = self.supervisor.run_with_deadline(
            move |token| run_on_worker(token, limits, &worker_bundle, &entrypoint, &props),
            max_duration,
        );

        match supervised {
            Supervised::Completed(Ok(result)) => match result.outcome {
                EngineOutcome::Returned(markup) => RenderResult::Success {
                    markup,
                    logs: result.console,
                },
                EngineOutcome::Threw(exception) => RenderFailure {
                    kind: exception.kind,
                    message: exception.message,
                    frames: translate_frames(&bundle, exception.frames),
                    logs: result.console,
                    elapsed_ms: None,
                }
                .into(),
            },
            Supervised::Completed(Err(e)) | Supervised::Failed(e) => engine_failure(e),
            Supervised::TimedOut { elapsed } => RenderFailure {
                elapsed_ms: Some(elapsed.as_millis() as u64),
                ..RenderFailure::new(
                    ErrorKind::Timeout,
                    format!("Render timed out after {}ms", max_duration.as_millis()),
                )
            }
            .into(),
        }
    }
}

fn engine_failure(error: EngineError) -> RenderResult {
    tracing::error!(error = %error, "render engine failure");
    RenderFailure::new(ErrorKind::Engine, error.to_string()).into()
}

/// Map engine frames through the bundle's source map. Frames in the render
/// glue scripts are dropped; frames without a mapping keep their generated
/// position.
pub fn translate_frames(bundle: &Bundle, frames: Vec<GeneratedFrame>) -> Vec<StackFrame> {
    frames
        .into_iter()
        .filter(|frame| !is_glue_frame(frame))
        .map(|frame| translate_frame(bundle, frame))
        .collect()
}

fn is_glue_frame(frame: &GeneratedFrame) -> bool {
    matches!(
        frame.file.as_deref(),
        Some(BOOTSTRAP_SCRIPT_NAME) | Some(RENDER_SCRIPT_NAME)
    )
}

fn translate_frame(bundle: &Bundle, frame: GeneratedFrame) -> StackFrame {
    let position = match (frame.file.as_deref(), frame.line, frame.column) {
        (Some(BUNDLE_SCRIPT_NAME), Some(line), Some(column)) if line > 0 && column > 0 => {
            Some(GeneratedPosition::new(line - 1, column - 1))
        }
        _ => None,
    };

    // The `names` entry at a throw site is the identifier there, not the
    // enclosing function, so it only fills in for anonymous frames.
    match position.and_then(|p| bundle.translate(p)) {
        Some(original) => StackFrame {
            function_name: frame.function_name.or(original.name),
            file: Some(original.source),
            line: Some(original.line + 1),
            column: Some(original.column + 1),
            mapped: true,
        },
        None => StackFrame {
            function_name: frame.function_name,
            file: frame.file,
            line: frame.line,
            column: frame.column,
            mapped: false,
        },
    }
}
