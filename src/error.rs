//! Error taxonomy for the render engine.
//!
//! Every failure a render can hit is returned to the caller as data inside a
//! [`RenderResult`](crate::RenderResult). The types here are the building
//! blocks: each one knows which [`ErrorKind`] it surfaces as.

use serde::Serialize;
use std::fmt;

/// Classification of a failed render, as seen by the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The bundle text could not be supplied.
    BundleLoad,
    /// The bundle text is not valid executable script.
    ScriptCompile,
    /// Uncaught exception while evaluating the bundle or the entrypoint.
    ScriptRuntime,
    /// The render deadline elapsed.
    Timeout,
    /// Props or the return value could not cross the engine boundary.
    Serialization,
    /// The engine heap ceiling was reached.
    HeapLimitExceeded,
    /// The engine or its worker thread failed outside of script control.
    Engine,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BundleLoad => "bundle_load",
            ErrorKind::ScriptCompile => "script_compile",
            ErrorKind::ScriptRuntime => "script_runtime",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Serialization => "serialization",
            ErrorKind::HeapLimitExceeded => "heap_limit_exceeded",
            ErrorKind::Engine => "engine",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The build collaborator could not supply a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleLoadError {
    #[error("bundle '{0}' not found")]
    NotFound(String),

    #[error("access denied: bundle '{0}' resolves outside the bundle directory")]
    AccessDenied(String),

    #[error("only .js bundles are allowed, got '{0}'")]
    InvalidExtension(String),

    #[error("failed to read bundle '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bundle directory '{path}' is unusable: {reason}")]
    InvalidRoot { path: String, reason: String },
}

/// A source map could not be decoded. Never fatal for a render.
#[derive(Debug, thiserror::Error)]
pub enum SourceMapParseError {
    #[error("source map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported source map version {0}, expected 3")]
    UnsupportedVersion(u32),

    #[error("indexed source maps (with `sections`) are not supported")]
    Indexed,

    #[error("invalid VLQ data on generated line {line}: {reason}")]
    Vlq { line: u32, reason: &'static str },

    #[error("segment on generated line {line} has {fields} fields, expected 1, 4 or 5")]
    SegmentArity { line: u32, fields: usize },

    #[error("segment on generated line {line} references {what} index {index} out of range")]
    IndexOutOfRange {
        line: u32,
        what: &'static str,
        index: i64,
    },

    #[error("segment on generated line {line} decodes to a negative {what}")]
    Negative { line: u32, what: &'static str },

    #[error("inline source map URL could not be decoded: {0}")]
    InlineUrl(String),
}

/// Props were rejected before reaching the engine.
#[derive(Debug, thiserror::Error)]
pub enum PropsError {
    #[error("invalid props JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("prototype pollution attempt: '{0}' key is forbidden in props")]
    ForbiddenKey(String),

    #[error("props nesting too deep (max {0} levels)")]
    TooDeep(usize),
}

/// The engine could not be brought up for a render.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn render worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to build worker event loop: {0}")]
    EventLoop(#[source] std::io::Error),

    #[error("sandbox bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("render worker panicked: {0}")]
    Panicked(String),
}
