//! Runtime configuration.
//!
//! Grounded on `CloudLLMConfig`: intentionally minimal, constructed manually with no file
//! parsing dependencies required. This config is likewise a plain struct built from
//! environment variables or literals, never a TOML/YAML layer.

use std::net::SocketAddr;

/// Global configuration for the orchestration runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// `DATABASE_URL` (§6). `None` or unreachable means degraded mode (§4.2).
    pub database_url: Option<String>,
    /// Hard wall-clock deadline per turn, default 120s (§5 "Cancellation & timeouts").
    pub turn_deadline_secs: u64,
    /// `MAX_LOOP_ITERATIONS` for loop team composition, default 8 (§4.4).
    pub max_loop_iterations: usize,
    /// The literal a sub-instance emits to end a loop composition early (§4.4, §9 Open
    /// Question resolution recorded in DESIGN.md).
    pub termination_marker: String,
    /// Grace period for cooperative cancellation to drain parallel children, default 500ms
    /// (§4.4 "parallel cancellation").
    pub parallel_cancel_grace_ms: u64,
    /// Address the HTTP/SSE surface binds to (C8, `server` feature only).
    pub bind_addr: SocketAddr,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            turn_deadline_secs: 120,
            max_loop_iterations: 8,
            termination_marker: "[[DONE]]".to_string(),
            parallel_cancel_grace_ms: 500,
            bind_addr: "127.0.0.1:8080".parse().expect("valid default bind address"),
        }
    }
}

impl RuntimeConfig {
    /// Build configuration from environment variables, falling back to defaults for anything
    /// absent or unparsable. Mirrors the common pattern of reading provider keys straight
    /// from `std::env::var`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.database_url = std::env::var("DATABASE_URL").ok();
        if let Ok(v) = std::env::var("TURN_DEADLINE_SECS") {
            if let Ok(v) = v.parse() {
                config.turn_deadline_secs = v;
            }
        }
        if let Ok(v) = std::env::var("MAX_LOOP_ITERATIONS") {
            if let Ok(v) = v.parse() {
                config.max_loop_iterations = v;
            }
        }
        if let Ok(v) = std::env::var("TERMINATION_MARKER") {
            config.termination_marker = v;
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            if let Ok(v) = v.parse() {
                config.bind_addr = v;
            }
        }
        config
    }
}
