//! Conversation Manager (C5): session lifecycle, ordered message log, write-through
//! persistence, history retrieval.
//!
//! Grounded on `session.rs`'s `LLMSession` (history-owning, token-budget-aware conversation
//! object), generalized from a single in-process session to a process-wide session table with
//! write-through persistence via the persistence layer and strict per-session append ordering.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::core::model::{AgentId, Conversation, Message, MessageRole, SessionId};
use crate::core::persistence::Store;

/// Errors raised by the Conversation Manager.
#[derive(Debug, Clone)]
pub enum ConversationManagerError {
    SessionNotFound(SessionId),
}

impl fmt::Display for ConversationManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationManagerError::SessionNotFound(id) => {
                write!(f, "session not found: {}", id)
            }
        }
    }
}

impl Error for ConversationManagerError {}

/// In-memory record for one active session: the [`Conversation`] header plus its ordered
/// message buffer. Appends are serialized by the per-session lock so that `created_at` is
/// strictly non-decreasing and indices are dense (§4.5 ordering guarantee).
struct SessionState {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// The read-only view of a turn's context handed to the Runner Adapter (C6): the session's
/// full message history plus the new user turn text.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub history: Vec<Message>,
    pub user_turn: String,
}

/// Owns the in-memory session table (`session_id -> Session`) and write-through persistence.
pub struct ConversationManager {
    store: Arc<dyn Store>,
    sessions: tokio::sync::RwLock<HashMap<SessionId, tokio::sync::Mutex<SessionState>>>,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sessions: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// `start(user_id, agent_id, initial_message?) -> session_id` (§4.5).
    pub async fn start(
        &self,
        user_id: &str,
        agent_id: &AgentId,
        initial_message: Option<String>,
    ) -> Result<SessionId, Box<dyn Error + Send + Sync>> {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conversation = Conversation {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            agent_id: agent_id.clone(),
            created_at: now,
            updated_at: now,
            is_active: true,
            message_count: 0,
            metadata: serde_json::Value::Null,
        };
        self.store.save_conversation(&conversation).await?;

        let state = SessionState {
            conversation,
            messages: Vec::new(),
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), tokio::sync::Mutex::new(state));
        }

        if let Some(text) = initial_message {
            self.append(&session_id, Message::draft(&session_id, MessageRole::User, text))
                .await?;
        }

        Ok(session_id)
    }

    /// `append(session_id, message)` (§4.5). Assigns `message_id`/`created_at`, updates
    /// counters, persists best-effort, and serializes on the per-session lock so that
    /// ordering holds even under concurrent callers.
    pub async fn append(
        &self,
        session_id: &SessionId,
        mut message: Message,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        self.ensure_loaded(session_id).await?;

        let sessions = self.sessions.read().await;
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| Box::new(ConversationManagerError::SessionNotFound(session_id.clone())) as Box<dyn Error + Send + Sync>)?;
        let mut state = slot.lock().await;

        message.message_id = Uuid::new_v4().to_string();
        message.created_at = Utc::now();
        message.session_id = session_id.clone();

        state.messages.push(message.clone());
        state.conversation.message_count = state.messages.len() as u64;
        state.conversation.updated_at = message.created_at;

        // last_message_at must update in the same transaction as append (§4.2 schema note).
        self.store
            .append_message_and_touch_conversation(&message, &state.conversation)
            .await?;

        Ok(message)
    }

    /// `get(session_id) -> Session + Messages`. Lazy-loads from C2 if not in memory;
    /// `SessionNotFound` if still missing.
    pub async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<(Conversation, Vec<Message>), Box<dyn Error + Send + Sync>> {
        self.ensure_loaded(session_id).await?;
        let sessions = self.sessions.read().await;
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| Box::new(ConversationManagerError::SessionNotFound(session_id.clone())) as Box<dyn Error + Send + Sync>)?;
        let state = slot.lock().await;
        Ok((state.conversation.clone(), state.messages.clone()))
    }

    /// `list_by_agent(agent_id, limit, offset)` (§4.5), delegated to C2.
    pub async fn list_by_agent(
        &self,
        agent_id: &AgentId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, Box<dyn Error + Send + Sync>> {
        self.store.list_conversations_by_agent(agent_id, limit, offset).await
    }

    /// `end(session_id)`: sets `is_active = false`.
    pub async fn end(&self, session_id: &SessionId) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ensure_loaded(session_id).await?;
        let sessions = self.sessions.read().await;
        if let Some(slot) = sessions.get(session_id) {
            let mut state = slot.lock().await;
            state.conversation.is_active = false;
            self.store.update_conversation(&state.conversation).await?;
        }
        Ok(())
    }

    /// `delete(session_id)` (hard). Deletes the conversation and cascades to its messages
    /// (§3 ownership: "deleting a Conversation deletes its Messages").
    pub async fn delete(&self, session_id: &SessionId) -> Result<(), Box<dyn Error + Send + Sync>> {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id);
        }
        self.store.delete_conversation(session_id).await
    }

    async fn ensure_loaded(&self, session_id: &SessionId) -> Result<(), Box<dyn Error + Send + Sync>> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(session_id) {
                return Ok(());
            }
        }
        let conversation = self
            .store
            .get_conversation(session_id)
            .await?
            .ok_or_else(|| Box::new(ConversationManagerError::SessionNotFound(session_id.clone())) as Box<dyn Error + Send + Sync>)?;
        let messages = self.store.list_messages_by_session(session_id, true).await?;
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| tokio::sync::Mutex::new(SessionState { conversation, messages }));
        Ok(())
    }
}
