//! SSR sandbox - executes one bundle render in a fresh V8 isolate.
//!
//! Each sandbox owns its own `JsRuntime`, so no global state survives from
//! one render to the next. Script failures are returned as data
//! ([`EngineOutcome::Threw`]) with the stack in generated positions; only
//! failures to bring the engine up are Rust errors.

use crate::bundle::Bundle;
use crate::error::{EngineError, ErrorKind};
use crate::ops::{ssr_runtime, ConsoleLine, ConsoleOutput, BOOTSTRAP_JS};
use crate::supervisor::WorkerToken;
use anyhow::Error;
use deno_core::error::{JsError, JsStackFrame};
use deno_core::{serde_v8, v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Script name the bundle is evaluated under; stack frames carry it.
pub const BUNDLE_SCRIPT_NAME: &str = "ssr:bundle.js";
pub(crate) const BOOTSTRAP_SCRIPT_NAME: &str = "ssr:bootstrap.js";
pub(crate) const RENDER_SCRIPT_NAME: &str = "ssr:render.js";

const MB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxLimits {
    pub max_heap_size: Option<usize>,
}

/// A stack frame as reported by the engine. One-based line and column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFrame {
    pub function_name: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl From<&JsStackFrame> for GeneratedFrame {
    fn from(frame: &JsStackFrame) -> Self {
        Self {
            function_name: frame.function_name.clone().filter(|n| !n.is_empty()),
            file: frame.file_name.clone(),
            line: frame.line_number.and_then(|n| u32::try_from(n).ok()),
            column: frame.column_number.and_then(|n| u32::try_from(n).ok()),
        }
    }
}

/// An uncaught script failure, returned as data.
#[derive(Debug, Clone)]
pub struct EngineException {
    pub kind: ErrorKind,
    pub message: String,
    pub frames: Vec<GeneratedFrame>,
}

impl EngineException {
    fn bare(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
        }
    }

    fn from_js_error(kind: ErrorKind, error: &JsError) -> Self {
        let message = error
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| error.exception_message.clone());
        Self {
            kind,
            message,
            frames: error.frames.iter().map(GeneratedFrame::from).collect(),
        }
    }

    fn heap_limit() -> Self {
        Self::bare(
            ErrorKind::HeapLimitExceeded,
            "Render exceeded the configured heap limit",
        )
    }
}

#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// Markup text, or the JSON text of a non-string return value.
    Returned(String),
    Threw(EngineException),
}

/// What one sandbox execution produced.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub outcome: EngineOutcome,
    pub console: Vec<ConsoleLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Evaluate,
    Render,
}

/// One isolate bound to one render.
pub struct Sandbox {
    runtime: JsRuntime,
    heap_exhausted: Arc<AtomicBool>,
}

impl Sandbox {
    pub fn new(limits: &SandboxLimits) -> Result<Self, EngineError> {
        // Configure V8 heap limits if specified
        let create_params = limits
            .max_heap_size
            .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ssr_runtime::init_ops()],
            create_params,
            ..Default::default()
        });

        let heap_exhausted = Arc::new(AtomicBool::new(false));
        if limits.max_heap_size.is_some() {
            let handle = runtime.v8_isolate().thread_safe_handle();
            let exhausted = Arc::clone(&heap_exhausted);
            runtime.add_near_heap_limit_callback(move |current, initial| {
                if !exhausted.swap(true, Ordering::SeqCst) {
                    tracing::warn!(
                        current_mb = current / MB,
                        initial_mb = initial / MB,
                        "render near heap limit, terminating"
                    );
                    handle.terminate_execution();
                }
                // Room for the termination to unwind instead of an OOM abort.
                current + 16 * MB
            });
        }

        runtime.op_state().borrow_mut().put(ConsoleOutput::default());

        runtime
            .execute_script(BOOTSTRAP_SCRIPT_NAME, BOOTSTRAP_JS.to_string())
            .map_err(|e| EngineError::Bootstrap(e.to_string()))?;

        Ok(Self {
            runtime,
            heap_exhausted,
        })
    }

    /// Handle that can stop this isolate's script from another thread.
    pub fn termination_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Evaluate `bundle`, call `entrypoint` with `props` and settle the result.
    ///
    /// The entrypoint is a dotted path on `globalThis` (`render`,
    /// `SSR.render`). It may return a string, a JSON-serializable value, or a
    /// Promise of either.
    pub async fn execute(
        &mut self,
        bundle: &Bundle,
        entrypoint: &str,
        props: &serde_json::Value,
    ) -> EngineResult {
        let outcome = self.run(bundle, entrypoint, props).await;

        let console = {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            std::mem::take(&mut state.borrow_mut::<ConsoleOutput>().lines)
        };

        EngineResult { outcome, console }
    }

    async fn run(
        &mut self,
        bundle: &Bundle,
        entrypoint: &str,
        props: &serde_json::Value,
    ) -> EngineOutcome {
        if let Err(err) = self
            .runtime
            .execute_script(BUNDLE_SCRIPT_NAME, bundle.code().to_string())
        {
            return EngineOutcome::Threw(self.exception(Stage::Evaluate, err));
        }

        let call = match render_call(entrypoint, props) {
            Ok(call) => call,
            Err(e) => {
                return EngineOutcome::Threw(EngineException::bare(
                    ErrorKind::Serialization,
                    format!("Props could not be serialized: {}", e),
                ))
            }
        };

        let value = match self.runtime.execute_script(RENDER_SCRIPT_NAME, call) {
            Ok(value) => value,
            Err(err) => return EngineOutcome::Threw(self.exception(Stage::Render, err)),
        };

        // Run event loop to handle any promises
        if let Err(err) = self
            .runtime
            .run_event_loop(PollEventLoopOptions::default())
            .await
        {
            return EngineOutcome::Threw(self.exception(Stage::Render, err));
        }

        self.settle(value)
    }

    fn exception(&self, stage: Stage, err: Error) -> EngineException {
        if self.heap_exhausted.load(Ordering::SeqCst) {
            return EngineException::heap_limit();
        }

        match err.downcast::<JsError>() {
            Ok(error) => {
                // A syntax error raised before any frame ran is a compile error.
                let compile = stage == Stage::Evaluate
                    && error.name.as_deref() == Some("SyntaxError")
                    && error.frames.is_empty();
                let kind = if compile {
                    ErrorKind::ScriptCompile
                } else {
                    ErrorKind::ScriptRuntime
                };
                EngineException::from_js_error(kind, &error)
            }
            Err(other) => EngineException::bare(ErrorKind::ScriptRuntime, other.to_string()),
        }
    }

    /// Turn the value returned by the render call into markup text.
    fn settle(&mut self, value: v8::Global<v8::Value>) -> EngineOutcome {
        if self.heap_exhausted.load(Ordering::SeqCst) {
            return EngineOutcome::Threw(EngineException::heap_limit());
        }

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, &value);

        let settled = match v8::Local::<v8::Promise>::try_from(local) {
            Ok(promise) => match promise.state() {
                v8::PromiseState::Fulfilled => promise.result(scope),
                v8::PromiseState::Rejected => {
                    let exception = promise.result(scope);
                    let error = JsError::from_v8_exception(scope, exception);
                    return EngineOutcome::Threw(EngineException::from_js_error(
                        ErrorKind::ScriptRuntime,
                        &error,
                    ));
                }
                v8::PromiseState::Pending => {
                    return EngineOutcome::Threw(EngineException::bare(
                        ErrorKind::ScriptRuntime,
                        "Render function returned unresolved promise",
                    ))
                }
            },
            Err(_) => local,
        };

        if settled.is_string() {
            return EngineOutcome::Returned(settled.to_rust_string_lossy(scope));
        }
        if settled.is_undefined() {
            return EngineOutcome::Threw(EngineException::bare(
                ErrorKind::Serialization,
                "Render function returned undefined",
            ));
        }

        match serde_v8::from_v8::<serde_json::Value>(scope, settled) {
            Ok(json) => EngineOutcome::Returned(json.to_string()),
            Err(e) => EngineOutcome::Threw(EngineException::bare(
                ErrorKind::Serialization,
                format!("Render result is not serializable: {}", e),
            )),
        }
    }
}

fn render_call(entrypoint: &str, props: &serde_json::Value) -> Result<String, serde_json::Error> {
    Ok(format!(
        "globalThis.__ssr_render__({}, {})",
        serde_json::to_string(entrypoint)?,
        serde_json::to_string(props)?
    ))
}

/// Body of a render worker: build an event loop and a fresh sandbox on the
/// current thread, hand the isolate's termination handle to the supervisor,
/// and execute. The sandbox is torn down before this returns.
pub fn run_on_worker(
    token: &WorkerToken,
    limits: SandboxLimits,
    bundle: &Bundle,
    entrypoint: &str,
    props: &serde_json::Value,
) -> Result<EngineResult, EngineError> {
    let event_loop = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(EngineError::EventLoop)?;

    event_loop.block_on(async {
        let mut sandbox = Sandbox::new(&limits)?;
        let handle = sandbox.termination_handle();
        token.on_terminate(move || {
            handle.terminate_execution();
        });
        Ok(sandbox.execute(bundle, entrypoint, props).await)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn execute(code: &str, entrypoint: &str, props: serde_json::Value) -> EngineResult {
        let bundle = Bundle::new("test.js", code, None);
        let mut sandbox = Sandbox::new(&SandboxLimits::default()).unwrap();
        sandbox.execute(&bundle, entrypoint, &props).await
    }

    fn markup(result: &EngineResult) -> &str {
        match &result.outcome {
            EngineOutcome::Returned(markup) => markup,
            EngineOutcome::Threw(e) => panic!("render threw: {:?}", e),
        }
    }

    fn exception(result: &EngineResult) -> &EngineException {
        match &result.outcome {
            EngineOutcome::Threw(e) => e,
            EngineOutcome::Returned(m) => panic!("expected exception, got markup {:?}", m),
        }
    }

    #[tokio::test]
    async fn test_returns_string_markup() {
        let result = execute(
            "function render(props) { return '<p>' + props.name + '</p>'; }",
            "render",
            json!({"name": "Ada"}),
        )
        .await;
        assert_eq!(markup(&result), "<p>Ada</p>");
        assert!(result.console.is_empty());
    }

    #[tokio::test]
    async fn test_dotted_entrypoint_and_json_result() {
        let result = execute(
            "var SSR = { page(props) { return { title: props.t, n: [1, 2] }; } };",
            "SSR.page",
            json!({"t": "Home"}),
        )
        .await;
        let value: serde_json::Value = serde_json::from_str(markup(&result)).unwrap();
        assert_eq!(value, json!({"title": "Home", "n": [1, 2]}));
    }

    #[tokio::test]
    async fn test_async_render_is_settled() {
        let result = execute(
            "async function render(p) { await null; return `<b>${p.x}</b>`; }",
            "render",
            json!({"x": 3}),
        )
        .await;
        assert_eq!(markup(&result), "<b>3</b>");
    }

    #[tokio::test]
    async fn test_console_is_captured_in_order() {
        let result = execute(
            r#"function render() {
                console.log("one", { a: 1 });
                console.warn("two");
                console.error("three");
                console.info(4);
                return "ok";
            }"#,
            "render",
            json!({}),
        )
        .await;
        assert_eq!(markup(&result), "ok");
        let lines: Vec<_> = result
            .console
            .iter()
            .map(|l| (l.level, l.message.as_str()))
            .collect();
        assert_eq!(
            lines,
            vec![
                (crate::ops::ConsoleLevel::Log, r#"one {"a":1}"#),
                (crate::ops::ConsoleLevel::Warn, "two"),
                (crate::ops::ConsoleLevel::Error, "three"),
                (crate::ops::ConsoleLevel::Info, "4"),
            ]
        );
    }

    #[tokio::test]
    async fn test_syntax_error_is_compile_error() {
        let result = execute("function render( { return 1; }", "render", json!({})).await;
        let e = exception(&result);
        assert_eq!(e.kind, ErrorKind::ScriptCompile);
    }

    #[tokio::test]
    async fn test_thrown_error_reports_generated_frame() {
        let code = "var a = 1;\nfunction render() {\n  throw new Error('boom');\n}\n";
        let result = execute(code, "render", json!({})).await;
        let e = exception(&result);
        assert_eq!(e.kind, ErrorKind::ScriptRuntime);
        assert_eq!(e.message, "boom");

        let top = &e.frames[0];
        assert_eq!(top.file.as_deref(), Some(BUNDLE_SCRIPT_NAME));
        assert_eq!(top.line, Some(3));
        assert_eq!(top.function_name.as_deref(), Some("render"));
    }

    #[tokio::test]
    async fn test_rejected_promise_is_runtime_error() {
        let result = execute(
            "async function render() { await null; throw new Error('later'); }",
            "render",
            json!({}),
        )
        .await;
        let e = exception(&result);
        assert_eq!(e.kind, ErrorKind::ScriptRuntime);
        assert!(e.message.contains("later"));
    }

    #[tokio::test]
    async fn test_missing_entrypoint() {
        let result = execute("var x = 1;", "render", json!({})).await;
        let e = exception(&result);
        assert_eq!(e.kind, ErrorKind::ScriptRuntime);
        assert!(e.message.contains("not a function"));
    }

    #[tokio::test]
    async fn test_undefined_result_is_serialization_error() {
        let result = execute("function render() {}", "render", json!({})).await;
        assert_eq!(exception(&result).kind, ErrorKind::Serialization);
    }

    #[tokio::test]
    async fn test_runaway_allocation_hits_heap_limit() {
        let bundle = Bundle::new(
            "hog.js",
            r#"function render() {
                const hoard = [];
                for (let i = 0; ; i++) {
                    hoard.push({ i, pad: "x".repeat(64) + i });
                }
            }"#,
            None,
        );
        let limits = SandboxLimits {
            max_heap_size: Some(32 * MB),
        };
        let mut sandbox = Sandbox::new(&limits).unwrap();
        let result = sandbox.execute(&bundle, "render", &json!({})).await;

        let e = exception(&result);
        assert_eq!(e.kind, ErrorKind::HeapLimitExceeded);
        assert!(e.frames.is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_globals() {
        let result = execute(
            r#"function render() {
                return [
                    typeof Deno,
                    typeof crypto.randomUUID(),
                    atob(btoa("hi")),
                    crypto.getRandomValues(new Uint8Array(4)).length,
                ].join(",");
            }"#,
            "render",
            json!({}),
        )
        .await;
        assert_eq!(markup(&result), "undefined,string,hi,4");
    }
}
