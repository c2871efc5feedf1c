//! Process-wide V8 platform setup.
//!
//! V8 needs its platform initialized exactly once per process, before the
//! first isolate is created. Render workers start on arbitrary threads, so
//! the first [`crate::RenderService`] does it up front on the caller's thread.

use deno_core::{JsRuntime, RuntimeOptions};
use std::sync::Once;

static PLATFORM: Once = Once::new();

/// Initialize the V8 platform. Later and concurrent calls are no-ops that
/// return once initialization has completed.
pub fn initialize() {
    PLATFORM.call_once(|| {
        // deno_core sets up the platform the first time an isolate is built;
        // build a throwaway one so that happens here and not on a worker.
        drop(JsRuntime::new(RuntimeOptions::default()));
        tracing::debug!("v8 platform initialized");
    });
}

/// Whether [`initialize`] has completed.
pub fn is_initialized() -> bool {
    PLATFORM.is_completed()
}
