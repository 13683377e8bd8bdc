//! Runner Adapter (C6): the sole boundary to the LLM execution engine.
//!
//! Grounded on `client_wrapper.rs`'s `ClientWrapper` trait (`send_message`/
//! `send_message_stream`, `MessageChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk,
//! _>>> + Send>>`), generalized to a richer tagged [`RawEvent`]: `agent.rs::send`'s tool-call
//! loop treats tool invocation/result as side effects interleaved with plain text chunks,
//! whereas here they are first-class stream items so the Streaming Handler (C7) can normalize
//! them without reaching back into the runner.

use std::error::Error;
use std::pin::Pin;

use futures_util::stream::Stream;
use serde_json::Value;

use crate::core::agent_registry::AgentInstance;
use crate::core::conversation_manager::TurnContext;

/// A single normalized event yielded by a [`Runner`]. The Streaming Handler (C7) is the only
/// consumer; it never inspects the adapter's wire format.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// An incremental text delta.
    PartialText(String),
    /// The model invoked a tool.
    ToolInvocation {
        name: String,
        args: Value,
        call_id: String,
    },
    /// A tool call's result became available.
    ToolResult { call_id: String, payload: String },
    /// A planner/reasoning trace fragment.
    Thinking(String),
    /// The adapter's own notion of "done" for this turn. May equal the concatenation of
    /// previously emitted `PartialText` deltas — the Streaming Handler is responsible for
    /// deduping that case (§4.7 step 2).
    Final(String),
    /// A fatal or recoverable error from the runner itself.
    Error { kind: String, message: String },
}

/// A lazy, single-consumer stream of [`RawEvent`]s for one turn. Restartable only at turn
/// boundaries (§4.6).
pub type RawEventStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;

/// The opaque boundary to the LLM execution engine (§4.6).
///
/// Suspension points are exclusively at `await next`; implementations must observe
/// `cancel_signal` before producing the next event, not mid-production.
#[async_trait::async_trait]
pub trait Runner: Send + Sync {
    /// Drive one turn of `agent_instance` with `turn_context`, yielding a lazy stream of
    /// [`RawEvent`]s. `cancel_signal` resolves when the caller requests cooperative
    /// cancellation (via `stop` or the turn deadline in §5).
    async fn run(
        &self,
        agent_instance: &AgentInstance,
        turn_context: &TurnContext,
        cancel_signal: tokio_util_cancel::CancelSignal,
    ) -> Result<RawEventStream, Box<dyn Error + Send + Sync>>;
}

/// A tiny cancellation primitive built on `tokio::sync::watch` rather than pulling in a
/// dedicated cancellation crate like `tokio-util`/`stop-token`.
pub mod tokio_util_cancel {
    use tokio::sync::watch;

    /// Cloneable handle a caller uses to request cancellation.
    #[derive(Clone)]
    pub struct CancelHandle {
        tx: watch::Sender<bool>,
    }

    /// Cloneable handle a callee awaits to observe cancellation.
    #[derive(Clone)]
    pub struct CancelSignal {
        rx: watch::Receiver<bool>,
    }

    /// Construct a fresh, not-yet-cancelled handle/signal pair.
    pub fn new_pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    impl CancelHandle {
        /// Request cancellation. Idempotent.
        pub fn cancel(&self) {
            let _ = self.tx.send(true);
        }
    }

    impl CancelSignal {
        /// True if cancellation has been requested.
        pub fn is_cancelled(&self) -> bool {
            *self.rx.borrow()
        }

        /// Resolves as soon as cancellation is requested. A no-op future if already cancelled.
        pub async fn cancelled(&mut self) {
            if self.is_cancelled() {
                return;
            }
            let _ = self.rx.changed().await;
        }
    }
}
