//! Render engine configuration.

use crate::sandbox::SandboxLimits;
use std::time::Duration;

/// Configuration for the render service
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Deadline for requests that do not carry their own (default: 30s)
    pub default_timeout: Duration,
    /// Maximum V8 heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_heap_size: Some(64 * 1024 * 1024),
        }
    }
}

impl RenderConfig {
    pub(crate) fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_heap_size: self.max_heap_size,
        }
    }
}
