//! Public, stable error kinds (§7).
//!
//! Hand-rolled `impl fmt::Display` + `impl Error` rather than a derive macro, matching
//! [`crate::core::tool_registry::ToolError`].

use std::error::Error;
use std::fmt;

/// Errors surfaced by the Agent Registry (§4.3 "Failure classes"), the Conversation Manager,
/// and the Team Composer. Each variant maps to exactly one REST status or SSE `error.kind`
/// per the table in §7.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// Missing agent/session/conversation. REST 404; never appears in an SSE stream.
    NotFound(String),
    /// Bad definition or config patch. REST 400.
    Validation(String),
    /// C3 failed to bind a tool. REST 400 at config time; SSE `error` at turn time.
    ToolUnavailable(String),
    /// A cycle was found in the agent-as-tool graph. REST 400.
    CyclicAgentTool(String),
    /// A team child failed to materialize. REST 400.
    SubAgentUnavailable(String),
    /// Persistence layer is unavailable. Logged only; never fails a request.
    PersistenceDegraded(String),
    /// A loop composition hit `MAX_LOOP_ITERATIONS`. SSE `error` then `complete`.
    LoopExhausted(String),
    /// The turn was cancelled (`stop` or deadline). SSE `error(cancelled)` then `complete`.
    Cancelled(String),
    /// The turn's wall-clock deadline was exceeded. SSE `error(timeout)` then `complete`.
    Timeout(String),
    /// The Runner produced an `error` RawEvent. SSE `error` passed through; turn ends.
    RunnerInternal(String),
}

impl CoreError {
    /// The stable `kind` string used in the SSE `error` event payload and in REST error
    /// bodies (§7).
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::Validation(_) => "validation",
            CoreError::ToolUnavailable(_) => "tool_unavailable",
            CoreError::CyclicAgentTool(_) => "cyclic_agent_tool",
            CoreError::SubAgentUnavailable(_) => "sub_agent_unavailable",
            CoreError::PersistenceDegraded(_) => "persistence_degraded",
            CoreError::LoopExhausted(_) => "loop_exhausted",
            CoreError::Cancelled(_) => "cancelled",
            CoreError::Timeout(_) => "timeout",
            CoreError::RunnerInternal(_) => "runner_internal",
        }
    }

    /// The REST status this kind maps to, when it surfaces through the HTTP surface (C8).
    /// `persistence_degraded` never reaches a handler as an error (§4.2); callers that hit it
    /// anyway are by definition misusing the API, so it maps to 500 for completeness.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 404,
            CoreError::Validation(_)
            | CoreError::ToolUnavailable(_)
            | CoreError::CyclicAgentTool(_)
            | CoreError::SubAgentUnavailable(_) => 400,
            CoreError::PersistenceDegraded(_) => 500,
            CoreError::LoopExhausted(_)
            | CoreError::Cancelled(_)
            | CoreError::Timeout(_)
            | CoreError::RunnerInternal(_) => 500,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            CoreError::Validation(msg) => write!(f, "validation error: {}", msg),
            CoreError::ToolUnavailable(msg) => write!(f, "tool unavailable: {}", msg),
            CoreError::CyclicAgentTool(msg) => write!(f, "cyclic agent tool reference: {}", msg),
            CoreError::SubAgentUnavailable(msg) => write!(f, "sub-agent unavailable: {}", msg),
            CoreError::PersistenceDegraded(msg) => write!(f, "persistence degraded: {}", msg),
            CoreError::LoopExhausted(msg) => write!(f, "loop exhausted: {}", msg),
            CoreError::Cancelled(msg) => write!(f, "cancelled: {}", msg),
            CoreError::Timeout(msg) => write!(f, "timeout: {}", msg),
            CoreError::RunnerInternal(msg) => write!(f, "runner error: {}", msg),
        }
    }
}

impl Error for CoreError {}
