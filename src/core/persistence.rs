//! Persistence Layer (C2): transactional CRUD over Agents, Conversations, Messages, with
//! graceful degradation when the database is absent or unreachable.
//!
//! `ThoughtChain`/`mentisdb` (in this codebase's memory sub-crates) are hash-chained JSONL
//! logs for semantic memory, not a transactional store for agents/conversations/messages, so
//! this module is grounded instead on `sqlx` (`runtime-tokio`, `sqlite`) — the async-first,
//! tokio-native relational client consistent with the rest of this codebase's all-tokio
//! posture (see DESIGN.md).
//!
//! `Store` is the narrow interface described in §4.2. `SqliteStore` backs it with a real
//! database; `DegradedStore` backs it with no-ops. Call sites never distinguish the two.

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::model::{AgentDefinition, Conversation, Message};

/// The narrow interface over a relational store (§4.2). Every method must tolerate degraded
/// mode: a `DegradedStore` implements every method as a no-op returning success, so call
/// sites never special-case persistence absence.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_agent(&self, agent: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>>;
    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentDefinition>, Box<dyn Error + Send + Sync>>;
    async fn list_agents(
        &self,
        active_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AgentDefinition>, Box<dyn Error + Send + Sync>>;
    async fn update_agent(&self, agent: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>>;
    /// Soft delete: `is_active = false`.
    async fn delete_agent(&self, agent_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
    async fn bump_agent_usage(&self, agent_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>>;
    async fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>, Box<dyn Error + Send + Sync>>;
    async fn list_conversations_by_agent(
        &self,
        agent_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, Box<dyn Error + Send + Sync>>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>>;
    /// Hard delete, cascading to the conversation's messages.
    async fn delete_conversation(&self, session_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Append one message and update the owning conversation's `last_message_at` in the same
    /// transaction (§4.2 schema note).
    async fn append_message_and_touch_conversation(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
    async fn list_messages_by_session(
        &self,
        session_id: &str,
        ascending: bool,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>>;
    async fn count_messages_by_session(&self, session_id: &str) -> Result<u64, Box<dyn Error + Send + Sync>>;
    async fn delete_messages_by_session(&self, session_id: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Construct a [`Store`] from `database_url`. On any failure (missing URL, unreachable
/// database, migration failure) returns a [`DegradedStore`] and logs one warning, per §4.2:
/// "if it does [fail], the system starts in degraded mode ... a warning is surfaced once at
/// startup."
pub async fn connect(database_url: Option<&str>) -> Arc<dyn Store> {
    match database_url {
        Some(url) => match SqliteStore::connect(url).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!("persistence_degraded: failed to connect to {}: {}", url, err);
                Arc::new(DegradedStore)
            }
        },
        None => {
            warn!("persistence_degraded: no DATABASE_URL configured, running without persistence");
            Arc::new(DegradedStore)
        }
    }
}

/// A live SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_agent(&self, agent: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>> {
        let tool_names = serde_json::to_string(&agent.tool_names)?;
        let sub_agent_ids = serde_json::to_string(&agent.sub_agent_ids)?;
        let agent_type = serde_json::to_string(&agent.agent_type)?;
        let planner = serde_json::to_string(&agent.planner)?;
        sqlx::query(
            "INSERT INTO agents (agent_id, name, version, is_active, description, personality, \
             expertise, communication_style, language, custom_instructions, model_id, \
             temperature, max_output_tokens, agent_type, planner, sub_agent_ids, tool_names, \
             usage_count, created_at, last_used_at, metadata) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&agent.agent_id)
        .bind(&agent.name)
        .bind(agent.version as i64)
        .bind(agent.is_active)
        .bind(&agent.description)
        .bind(&agent.personality)
        .bind(serde_json::to_string(&agent.expertise)?)
        .bind(&agent.communication_style)
        .bind(&agent.language)
        .bind(&agent.custom_instructions)
        .bind(&agent.model_id)
        .bind(agent.temperature)
        .bind(agent.max_output_tokens.map(|v| v as i64))
        .bind(agent_type)
        .bind(planner)
        .bind(sub_agent_ids)
        .bind(tool_names)
        .bind(agent.usage_count as i64)
        .bind(agent.created_at)
        .bind(agent.last_used_at)
        .bind(agent.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentDefinition>, Box<dyn Error + Send + Sync>> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_agent(&r)).transpose()?)
    }

    async fn list_agents(
        &self,
        active_only: bool,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AgentDefinition>, Box<dyn Error + Send + Sync>> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM agents WHERE is_active = 1 ORDER BY created_at LIMIT ? OFFSET ?")
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM agents ORDER BY created_at LIMIT ? OFFSET ?")
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(row_to_agent).collect()
    }

    async fn update_agent(&self, agent: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query(
            "UPDATE agents SET name=?, is_active=?, description=?, personality=?, expertise=?, \
             communication_style=?, language=?, custom_instructions=?, model_id=?, temperature=?, \
             max_output_tokens=?, agent_type=?, planner=?, sub_agent_ids=?, tool_names=?, \
             usage_count=?, last_used_at=?, metadata=?, version=version+1 WHERE agent_id=?",
        )
        .bind(&agent.name)
        .bind(agent.is_active)
        .bind(&agent.description)
        .bind(&agent.personality)
        .bind(serde_json::to_string(&agent.expertise)?)
        .bind(&agent.communication_style)
        .bind(&agent.language)
        .bind(&agent.custom_instructions)
        .bind(&agent.model_id)
        .bind(agent.temperature)
        .bind(agent.max_output_tokens.map(|v| v as i64))
        .bind(serde_json::to_string(&agent.agent_type)?)
        .bind(serde_json::to_string(&agent.planner)?)
        .bind(serde_json::to_string(&agent.sub_agent_ids)?)
        .bind(serde_json::to_string(&agent.tool_names)?)
        .bind(agent.usage_count as i64)
        .bind(agent.last_used_at)
        .bind(agent.metadata.to_string())
        .bind(&agent.agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query("UPDATE agents SET is_active = 0 WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_agent_usage(&self, agent_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query(
            "UPDATE agents SET usage_count = usage_count + 1, last_used_at = ? WHERE agent_id = ?",
        )
        .bind(chrono::Utc::now())
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_conversation(&self, c: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query(
            "INSERT INTO conversations (session_id, user_id, agent_id, created_at, updated_at, \
             is_active, message_count, metadata) VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(&c.session_id)
        .bind(&c.user_id)
        .bind(&c.agent_id)
        .bind(c.created_at)
        .bind(c.updated_at)
        .bind(c.is_active)
        .bind(c.message_count as i64)
        .bind(c.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>, Box<dyn Error + Send + Sync>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_conversation(&r)).transpose()?)
    }

    async fn list_conversations_by_agent(
        &self,
        agent_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Conversation>, Box<dyn Error + Send + Sync>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations WHERE agent_id = ? ORDER BY created_at LIMIT ? OFFSET ?",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    async fn update_conversation(&self, c: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query(
            "UPDATE conversations SET updated_at=?, is_active=?, message_count=?, metadata=? \
             WHERE session_id=?",
        )
        .bind(c.updated_at)
        .bind(c.is_active)
        .bind(c.message_count as i64)
        .bind(c.metadata.to_string())
        .bind(&c.session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_conversation(&self, session_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_message_and_touch_conversation(
        &self,
        message: &Message,
        conversation: &Conversation,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (message_id, session_id, role, content, message_type, \
             tool_name, tool_args, tool_call_id, is_streaming, is_complete, created_at, metadata) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&message.message_id)
        .bind(&message.session_id)
        .bind(serde_json::to_string(&message.role)?)
        .bind(&message.content)
        .bind(serde_json::to_string(&message.message_type)?)
        .bind(&message.tool_name)
        .bind(message.tool_args.as_ref().map(|v| v.to_string()))
        .bind(&message.tool_call_id)
        .bind(message.is_streaming)
        .bind(message.is_complete)
        .bind(message.created_at)
        .bind(message.metadata.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE conversations SET message_count=?, updated_at=? WHERE session_id=?",
        )
        .bind(conversation.message_count as i64)
        .bind(message.created_at)
        .bind(&conversation.session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_messages_by_session(
        &self,
        session_id: &str,
        ascending: bool,
    ) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        let order = if ascending { "ASC" } else { "DESC" };
        let query = format!("SELECT * FROM messages WHERE session_id = ? ORDER BY created_at {}", order);
        let rows = sqlx::query(&query).bind(session_id).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn count_messages_by_session(&self, session_id: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM messages WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let cnt: i64 = row.try_get("cnt")?;
        Ok(cnt as u64)
    }

    async fn delete_messages_by_session(&self, session_id: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Result<AgentDefinition, Box<dyn Error + Send + Sync>> {
    let expertise: String = row.try_get("expertise")?;
    let tool_names: String = row.try_get("tool_names")?;
    let sub_agent_ids: String = row.try_get("sub_agent_ids")?;
    let agent_type: String = row.try_get("agent_type")?;
    let planner: String = row.try_get("planner")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(AgentDefinition {
        agent_id: row.try_get("agent_id")?,
        name: row.try_get("name")?,
        version: row.try_get::<i64, _>("version")? as u64,
        is_active: row.try_get("is_active")?,
        description: row.try_get("description")?,
        personality: row.try_get("personality")?,
        expertise: serde_json::from_str(&expertise)?,
        communication_style: row.try_get("communication_style")?,
        language: row.try_get("language")?,
        custom_instructions: row.try_get("custom_instructions")?,
        model_id: row.try_get("model_id")?,
        temperature: row.try_get("temperature")?,
        max_output_tokens: row.try_get::<Option<i64>, _>("max_output_tokens")?.map(|v| v as u32),
        agent_type: serde_json::from_str(&agent_type)?,
        planner: serde_json::from_str(&planner)?,
        sub_agent_ids: serde_json::from_str(&sub_agent_ids)?,
        tool_names: serde_json::from_str(&tool_names)?,
        usage_count: row.try_get::<i64, _>("usage_count")? as u64,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation, Box<dyn Error + Send + Sync>> {
    let metadata: String = row.try_get("metadata")?;
    Ok(Conversation {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        agent_id: row.try_get("agent_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        is_active: row.try_get("is_active")?,
        message_count: row.try_get::<i64, _>("message_count")? as u64,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message, Box<dyn Error + Send + Sync>> {
    let role: String = row.try_get("role")?;
    let message_type: String = row.try_get("message_type")?;
    let tool_args: Option<String> = row.try_get("tool_args")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Message {
        message_id: row.try_get("message_id")?,
        session_id: row.try_get("session_id")?,
        role: serde_json::from_str(&role)?,
        content: row.try_get("content")?,
        message_type: serde_json::from_str(&message_type)?,
        tool_name: row.try_get("tool_name")?,
        tool_args: tool_args.map(|s| serde_json::from_str(&s)).transpose()?,
        tool_call_id: row.try_get("tool_call_id")?,
        is_streaming: row.try_get("is_streaming")?,
        is_complete: row.try_get("is_complete")?,
        created_at: row.try_get("created_at")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

/// Degraded-mode store: every operation is a no-op that succeeds, per §4.2: "all persistence
/// calls become no-ops ... no persistence failure during a turn is allowed to abort the turn."
pub struct DegradedStore;

#[async_trait]
impl Store for DegradedStore {
    async fn save_agent(&self, _: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn get_agent(&self, _: &str) -> Result<Option<AgentDefinition>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
    async fn list_agents(&self, _: bool, _: u32, _: u32) -> Result<Vec<AgentDefinition>, Box<dyn Error + Send + Sync>> {
        Ok(Vec::new())
    }
    async fn update_agent(&self, _: &AgentDefinition) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn delete_agent(&self, _: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn bump_agent_usage(&self, _: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn save_conversation(&self, _: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn get_conversation(&self, _: &str) -> Result<Option<Conversation>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
    async fn list_conversations_by_agent(&self, _: &str, _: u32, _: u32) -> Result<Vec<Conversation>, Box<dyn Error + Send + Sync>> {
        Ok(Vec::new())
    }
    async fn update_conversation(&self, _: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn delete_conversation(&self, _: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn append_message_and_touch_conversation(&self, _: &Message, _: &Conversation) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
    async fn list_messages_by_session(&self, _: &str, _: bool) -> Result<Vec<Message>, Box<dyn Error + Send + Sync>> {
        Ok(Vec::new())
    }
    async fn count_messages_by_session(&self, _: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
        Ok(0)
    }
    async fn delete_messages_by_session(&self, _: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}
