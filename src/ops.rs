//! Ops exposed to bundles through the `ssr_runtime` extension.
//!
//! Provides only the minimal APIs needed for SSR:
//! - console.log/info/debug/warn/error (captured, not printed)
//! - crypto.randomUUID, crypto.getRandomValues, crypto.subtle.digest
//! - atob, btoa

use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use serde::Serialize;

// ============================================================================
// Console Output Capture
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "LOG",
            ConsoleLevel::Info => "INFO",
            ConsoleLevel::Debug => "DEBUG",
            ConsoleLevel::Warn => "WARN",
            ConsoleLevel::Error => "ERROR",
        }
    }
}

/// One console call made by the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Console lines of the current render, in emission order.
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub lines: Vec<ConsoleLine>,
}

fn push_line(state: &mut OpState, level: ConsoleLevel, msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.lines.push(ConsoleLine {
            level,
            message: msg.to_string(),
        });
    }
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    push_line(state, ConsoleLevel::Log, msg);
}

#[op2(fast)]
pub fn op_console_info(state: &mut OpState, #[string] msg: &str) {
    push_line(state, ConsoleLevel::Info, msg);
}

#[op2(fast)]
pub fn op_console_debug(state: &mut OpState, #[string] msg: &str) {
    push_line(state, ConsoleLevel::Debug, msg);
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    push_line(state, ConsoleLevel::Warn, msg);
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    push_line(state, ConsoleLevel::Error, msg);
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
pub fn op_crypto_subtle_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    digest(algorithm, data)
}

fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let result = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
                algorithm
            ))
        }
    };

    Ok(result)
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    ssr_runtime,
    ops = [
        op_console_log,
        op_console_info,
        op_console_debug,
        op_console_warn,
        op_console_error,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_crypto_subtle_digest,
        op_btoa,
        op_atob,
    ],
);

/// JS glue installed into every fresh runtime before the bundle runs.
pub const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_algorithms() {
        assert_eq!(digest("SHA-256", b"abc").unwrap().len(), 32);
        assert_eq!(digest("sha384", b"abc").unwrap().len(), 48);
        assert_eq!(digest("SHA-512", b"abc").unwrap().len(), 64);
        assert!(digest("MD5", b"abc").is_err());
    }

    #[test]
    fn test_console_level_serializes_lowercase() {
        let line = ConsoleLine {
            level: ConsoleLevel::Warn,
            message: "careful".into(),
        };
        assert_eq!(
            serde_json::to_value(&line).unwrap(),
            serde_json::json!({"level": "warn", "message": "careful"})
        );
    }
}
