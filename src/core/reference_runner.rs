//! A reference [`Runner`] implementation with no upstream LLM dependency.
//!
//! The actual LLM execution engine is an external collaborator (§1): this crate defines the
//! boundary (`Runner`) but deliberately carries no HTTP client or provider SDK of its own.
//! `EchoRunner` exists so `agentmeshd` has something to drive out of the box — in the shape of
//! the `MockClient` test doubles seen across `agent_tests.rs`/`orchestration_tests.rs`: it
//! reads the system prompt and the user's turn, chunks a deterministic reply into
//! `PartialText` deltas, and finishes with a `Final` echo. Production deployments replace it
//! with a `Runner` that calls out to a real model.

use std::error::Error;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};

use crate::core::agent_registry::AgentInstance;
use crate::core::conversation_manager::TurnContext;
use crate::core::runner::{tokio_util_cancel::CancelSignal, RawEvent, Runner, RawEventStream};

/// Splits its reply into chunks of this many characters before streaming them.
const CHUNK_SIZE: usize = 24;

/// Echoes the user's turn back, prefixed by the agent's persona, one chunk at a time.
///
/// Useful for exercising the rest of the pipeline (materialization, team composition,
/// streaming, persistence, HTTP/SSE) without a live model behind it.
pub struct EchoRunner;

#[async_trait]
impl Runner for EchoRunner {
    async fn run(
        &self,
        agent_instance: &AgentInstance,
        turn_context: &TurnContext,
        cancel_signal: CancelSignal,
    ) -> Result<RawEventStream, Box<dyn Error + Send + Sync>> {
        let reply = format!("[{}] {}", agent_instance.agent_id, turn_context.user_turn);
        let chunks: Vec<String> = reply
            .as_bytes()
            .chunks(CHUNK_SIZE)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        let final_text = reply;

        let mut raw_events: Vec<RawEvent> = chunks.into_iter().map(RawEvent::PartialText).collect();
        raw_events.push(RawEvent::Final(final_text));

        let events = stream::iter(raw_events)
            .then(move |event| {
                let cancel_signal = cancel_signal.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    (event, cancel_signal.is_cancelled())
                }
            })
            .take_while(|(_, cancelled)| {
                let cancelled = *cancelled;
                async move { !cancelled }
            })
            .map(|(event, _)| event);

        let events: Pin<Box<dyn Stream<Item = RawEvent> + Send>> = Box::pin(events);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::tokio_util_cancel;

    fn test_instance() -> AgentInstance {
        AgentInstance {
            agent_id: "echo-agent".to_string(),
            definition_version: 1,
            system_prompt: String::new(),
            model_id: "echo".to_string(),
            temperature: 1.0,
            max_output_tokens: None,
            planner: crate::core::model::PlannerKind::None,
            tools: vec![],
            agent_tools: vec![],
            team: None,
        }
    }

    #[tokio::test]
    async fn streams_partial_text_then_final_echo() {
        let instance = test_instance();
        let turn_context = TurnContext {
            session_id: "s1".to_string(),
            agent_id: "echo-agent".to_string(),
            history: vec![],
            user_turn: "hello there".to_string(),
        };
        let (_handle, signal) = tokio_util_cancel::new_pair();

        let runner = EchoRunner;
        let mut stream = runner.run(&instance, &turn_context, signal).await.unwrap();

        let mut saw_final = false;
        while let Some(event) = stream.next().await {
            if let RawEvent::Final(text) = event {
                assert!(text.contains("hello there"));
                saw_final = true;
            }
        }
        assert!(saw_final);
    }
}
