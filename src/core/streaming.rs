//! Streaming Handler (C7): normalizes [`RawEvent`]s into the public event taxonomy, dedupes
//! final-response echoes, writes through to persistence, and fans out to SSE subscribers.
//!
//! Grounded on `event.rs`'s `EventHandler`/`AgentEvent` pattern: a single async `emit` hook
//! plus a fire-and-forget `emit_sync` (here realized as the broadcast fan-out), generalized to
//! the accumulator/dedup algorithm this system requires on top of forwarding chunks verbatim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::core::agent_registry::AgentRegistry;
use crate::core::config::RuntimeConfig;
use crate::core::conversation_manager::{ConversationManager, TurnContext};
use crate::core::model::{AgentId, Message, MessageRole, MessageType, SessionId};
use crate::core::runner::tokio_util_cancel::{self, CancelSignal};
use crate::core::runner::{RawEvent, Runner};
use crate::core::team_composer::{self, TaggedEvent};

/// The public event taxonomy (§4.7 table). `session_id`/`created_at` are stamped by the
/// handler, not by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

/// One entry of the public taxonomy (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    Start,
    Content,
    Thinking,
    ToolCall,
    ToolResponse,
    Error,
    Complete,
}

impl StreamEvent {
    fn new(event_type: StreamEventType, session_id: &SessionId, content: Value, origin_agent_id: Option<&AgentId>) -> Self {
        let metadata = origin_agent_id.map(|id| serde_json::json!({ "origin_agent_id": id }));
        Self {
            event_type,
            content,
            metadata,
            session_id: session_id.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Owns the per-session broadcast channels SSE handlers subscribe to (C8) and drives turns
/// end to end: materialize → run → normalize → persist → fan out (§4.7, §5 control flow).
pub struct StreamingHandler {
    agents: Arc<AgentRegistry>,
    conversations: Arc<ConversationManager>,
    runner: Arc<dyn Runner>,
    config: Arc<RuntimeConfig>,
    channels: tokio::sync::RwLock<std::collections::HashMap<SessionId, broadcast::Sender<StreamEvent>>>,
}

/// Above this length a `final` whose stripped text equals the accumulator's stripped text is
/// a pure echo and is suppressed (§4.7 step 2).
const FINAL_ECHO_DEDUP_THRESHOLD: usize = 1000;

impl StreamingHandler {
    pub fn new(
        agents: Arc<AgentRegistry>,
        conversations: Arc<ConversationManager>,
        runner: Arc<dyn Runner>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            agents,
            conversations,
            runner,
            config,
            channels: tokio::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Subscribe to a session's event stream. Late subscribers receive only events published
    /// after subscription, per §4.7 step 5.
    pub async fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(512).0)
            .subscribe()
    }

    /// `stop(session_id)`: cancel every active runner driving this session. Delegated to the
    /// Agent Registry, which tracks cancel handles per agent (§4.3, §5). Because sessions are
    /// one-turn-at-a-time, this is equivalent to cancelling the session's in-flight turn.
    pub async fn stop_session(&self, agent_id: &AgentId) {
        self.agents.stop(agent_id).await;
    }

    /// Drive one turn: append the user message, materialize the agent, run it, normalize
    /// events, persist, and publish. Returns once the turn reaches `complete`.
    pub async fn send(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        user_text: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Err(err) = self
            .conversations
            .append(session_id, Message::draft(session_id, MessageRole::User, user_text.clone()))
            .await
        {
            warn!("failed to persist user message: {}", err);
        }

        let instance = self.agents.ensure_instance(agent_id).await?;
        let (_, history) = self.conversations.get(session_id).await?;

        let turn_context = TurnContext {
            session_id: session_id.clone(),
            agent_id: agent_id.clone(),
            history,
            user_turn: user_text,
        };

        let (cancel_handle, cancel_signal) = tokio_util_cancel::new_pair();
        self.agents.track_session(agent_id, cancel_handle.clone()).await;

        self.publish(session_id, StreamEvent::new(
            StreamEventType::Start,
            session_id,
            serde_json::json!({ "session_id": session_id, "agent_id": agent_id }),
            None,
        )).await;

        let deadline = tokio::time::sleep(std::time::Duration::from_secs(self.config.turn_deadline_secs));
        tokio::pin!(deadline);

        let rx = team_composer::run_instance(
            instance,
            self.runner.clone(),
            turn_context,
            cancel_signal.clone(),
            self.config.clone(),
        );

        let outcome = tokio::select! {
            () = &mut deadline => {
                cancel_handle.cancel();
                Outcome::TimedOut
            },
            acc = self.drain(session_id, rx, &cancel_signal) => acc,
        };

        match outcome {
            Outcome::Completed(acc) | Outcome::ErrorEmitted(acc) => {
                self.finish_turn(session_id, agent_id, acc, None).await;
            }
            Outcome::Cancelled(acc) => {
                self.finish_turn(session_id, agent_id, acc, Some(("cancelled", "turn was cancelled"))).await;
            }
            Outcome::TimedOut => {
                self.finish_turn(session_id, agent_id, String::new(), Some(("timeout", "turn deadline exceeded"))).await;
            }
        }

        Ok(())
    }

    /// Drains the tagged-event channel until the runner finishes or the cancel signal fires.
    /// A `RawEvent::Error` publishes its own error event and ends the drain immediately
    /// (`ErrorEmitted`, so `finish_turn` doesn't publish a second, mislabeled one). A channel
    /// close with no terminal event means either a clean finish or a cooperative cancellation
    /// that the runner honored silently — `cancel` distinguishes the two (§4.7 step 6).
    async fn drain(
        &self,
        session_id: &SessionId,
        mut rx: tokio::sync::mpsc::Receiver<TaggedEvent>,
        cancel: &CancelSignal,
    ) -> Outcome {
        let mut acc = String::new();
        while let Some((origin_agent_id, event)) = rx.recv().await {
            match event {
                RawEvent::PartialText(delta) => {
                    acc.push_str(&delta);
                    self.publish(session_id, StreamEvent::new(
                        StreamEventType::Content,
                        session_id,
                        serde_json::json!({ "delta": delta }),
                        Some(&origin_agent_id),
                    )).await;
                }
                RawEvent::Final(text) => {
                    if let Some(suffix) = final_echo_dedup(&acc, &text) {
                        acc.push_str(&suffix);
                        self.publish(session_id, StreamEvent::new(
                            StreamEventType::Content,
                            session_id,
                            serde_json::json!({ "delta": suffix }),
                            Some(&origin_agent_id),
                        )).await;
                    }
                }
                RawEvent::ToolInvocation { name, args, call_id } => {
                    self.publish(session_id, StreamEvent::new(
                        StreamEventType::ToolCall,
                        session_id,
                        serde_json::json!({ "tool_name": name, "tool_args": args, "call_id": call_id.clone() }),
                        Some(&origin_agent_id),
                    )).await;
                    let message = Message {
                        message_type: MessageType::ToolCall,
                        tool_name: Some(name),
                        tool_args: Some(args),
                        tool_call_id: Some(call_id),
                        ..Message::draft(session_id, MessageRole::Assistant, String::new())
                    };
                    if let Err(err) = self.conversations.append(session_id, message).await {
                        warn!("failed to persist tool_call message: {}", err);
                    }
                }
                RawEvent::ToolResult { call_id, payload } => {
                    let structured: Value = serde_json::from_str(&payload).unwrap_or(Value::String(payload.clone()));
                    self.publish(session_id, StreamEvent::new(
                        StreamEventType::ToolResponse,
                        session_id,
                        serde_json::json!({ "call_id": call_id.clone(), "result": structured }),
                        Some(&origin_agent_id),
                    )).await;
                    let message = Message {
                        message_type: MessageType::ToolResponse,
                        tool_call_id: Some(call_id),
                        ..Message::draft(session_id, MessageRole::Tool, payload)
                    };
                    if let Err(err) = self.conversations.append(session_id, message).await {
                        warn!("failed to persist tool_response message: {}", err);
                    }
                }
                RawEvent::Thinking(text) => {
                    self.publish(session_id, StreamEvent::new(
                        StreamEventType::Thinking,
                        session_id,
                        serde_json::json!({ "text": text }),
                        Some(&origin_agent_id),
                    )).await;
                }
                RawEvent::Error { kind, message } => {
                    error!("runner error on session {}: {} ({})", session_id, message, kind);
                    self.publish(session_id, StreamEvent::new(
                        StreamEventType::Error,
                        session_id,
                        serde_json::json!({ "kind": kind, "message": message }),
                        Some(&origin_agent_id),
                    )).await;
                    return Outcome::ErrorEmitted(acc);
                }
            }
        }
        if cancel.is_cancelled() {
            Outcome::Cancelled(acc)
        } else {
            Outcome::Completed(acc)
        }
    }

    async fn finish_turn(
        &self,
        session_id: &SessionId,
        _agent_id: &AgentId,
        acc: String,
        error_kind: Option<(&str, &str)>,
    ) {
        if let Some((kind, message)) = error_kind {
            self.publish(session_id, StreamEvent::new(
                StreamEventType::Error,
                session_id,
                serde_json::json!({ "kind": kind, "message": message }),
                None,
            )).await;
        }

        if !acc.is_empty() {
            if let Err(err) = self
                .conversations
                .append(session_id, Message::draft(session_id, MessageRole::Assistant, acc.clone()))
                .await
            {
                warn!("failed to persist assistant message: {}", err);
            }
        }

        self.publish(session_id, StreamEvent::new(
            StreamEventType::Complete,
            session_id,
            serde_json::json!({ "final_text": acc }),
            None,
        )).await;
    }

    async fn publish(&self, session_id: &SessionId, event: StreamEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(session_id) {
            // No subscribers is not an error: a turn may run with nobody watching.
            let _ = tx.send(event);
        }
    }
}

enum Outcome {
    Completed(String),
    /// The runner emitted `RawEvent::Error` directly; an error event is already published.
    ErrorEmitted(String),
    Cancelled(String),
    TimedOut,
}

/// Implements §4.7 step 2 exactly: suppress a `final` whose stripped text is long and equals
/// the accumulator's stripped text; otherwise return the suffix of `text` after its longest
/// common prefix with `acc`, to emit as one more `content` delta. Returns `None` when nothing
/// should be emitted.
fn final_echo_dedup(acc: &str, text: &str) -> Option<String> {
    if text.len() > FINAL_ECHO_DEDUP_THRESHOLD && text.trim() == acc.trim() {
        return None;
    }
    let prefix_len = acc
        .chars()
        .zip(text.chars())
        .take_while(|(a, b)| a == b)
        .count();
    let common_prefix_bytes: usize = acc.chars().take(prefix_len).map(|c| c.len_utf8()).sum();
    Some(text[common_prefix_bytes.min(text.len())..].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_long_exact_echo() {
        let acc = "x".repeat(1200);
        let text = acc.clone();
        assert_eq!(final_echo_dedup(&acc, &text), None);
    }

    #[test]
    fn dedup_emits_suffix_for_short_or_divergent_final() {
        let acc = "hello ".to_string();
        let text = "hello world".to_string();
        assert_eq!(final_echo_dedup(&acc, &text), Some("world".to_string()));
    }

    #[test]
    fn dedup_emits_full_text_when_no_common_prefix() {
        let acc = "abc".to_string();
        let text = "xyz".to_string();
        assert_eq!(final_echo_dedup(&acc, &text), Some("xyz".to_string()));
    }
}
