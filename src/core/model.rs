//! Durable data model: [`AgentDefinition`], [`ToolDescriptor`], [`Conversation`], [`Message`].
//!
//! These are the wire/storage shapes described in the system's data model. The runtime,
//! ephemeral counterpart to [`AgentDefinition`] is [`crate::core::agent_registry::AgentInstance`],
//! which is never serialized and never persisted.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque, globally unique agent identifier.
pub type AgentId = String;

/// Opaque, globally unique session identifier.
pub type SessionId = String;

/// The composition role of an agent. Non-`Standard`/`React` variants are team kinds and
/// require a non-empty [`AgentDefinition::sub_agent_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Standard,
    React,
    Sequential,
    Parallel,
    Hierarchical,
    Loop,
}

impl AgentType {
    /// True for the team composition kinds (§3: "non-empty iff `agent_type` ∈
    /// {sequential, parallel, hierarchical, loop}").
    pub fn is_team(self) -> bool {
        matches!(
            self,
            AgentType::Sequential | AgentType::Parallel | AgentType::Hierarchical | AgentType::Loop
        )
    }
}

/// Which planner, if any, wraps the agent's turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    None,
    PlanReActPlanner,
    BuiltInPlanner,
}

/// The durable description of an agent (§3 `AgentDefinition`).
///
/// Invariants enforced by [`crate::core::agent_registry::AgentRegistry`]:
/// - `agent_id` is immutable once assigned.
/// - `tool_names` is only checked against known tools (plus `agent:*` references) at bind
///   time, in [`AgentRegistry::ensure_instance`](crate::core::agent_registry::AgentRegistry::ensure_instance).
/// - team agents (`agent_type.is_team()`) do not expose `tool_names` directly; they orchestrate
///   `sub_agent_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_id: AgentId,
    pub name: String,
    pub version: u64,
    pub is_active: bool,

    pub description: String,
    pub personality: Option<String>,
    pub expertise: Vec<String>,
    pub communication_style: Option<String>,
    pub language: Option<String>,
    pub custom_instructions: Option<String>,

    pub model_id: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    pub agent_type: AgentType,
    pub planner: PlannerKind,

    /// Ordered sequence of sub-agent ids. Non-empty iff `agent_type.is_team()`.
    pub sub_agent_ids: Vec<AgentId>,

    /// Tool names, possibly including `agent:<agent_id>` references.
    pub tool_names: BTreeSet<String>,

    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl AgentDefinition {
    /// A bare-bones standard agent, useful as a starting point for builders and tests.
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            version: 1,
            is_active: true,
            description: String::new(),
            personality: None,
            expertise: Vec::new(),
            communication_style: None,
            language: None,
            custom_instructions: None,
            model_id: model_id.into(),
            temperature: 0.7,
            max_output_tokens: None,
            agent_type: AgentType::Standard,
            planner: PlannerKind::None,
            sub_agent_ids: Vec::new(),
            tool_names: BTreeSet::new(),
            usage_count: 0,
            created_at: Utc::now(),
            last_used_at: None,
            metadata: Value::Null,
        }
    }

    /// Returns the subset of `tool_names` referring to other agents, with the `agent:` prefix
    /// stripped. C1 never resolves these; C3 does, recursively.
    pub fn agent_tool_ids(&self) -> impl Iterator<Item = &str> {
        self.tool_names
            .iter()
            .filter_map(|t| t.strip_prefix("agent:"))
    }
}

/// Distinguishes an absent key (outer `None`, "leave unchanged") from an explicit JSON
/// `null` (`Some(None)`, "clear the field") for the double-`Option` fields below, since stock
/// `Deserialize` collapses both to `None`.
fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// A patch applied by `update_config` (§4.3, §6 `PUT /agents/{id}/config`). A key absent from
/// the JSON body leaves the field unchanged; a key present with value `null` clears it
/// (`agent_type` resets to `Standard`, `planner` to `None`, `tools` to empty); a key present
/// with a value sets it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfigPatch {
    #[serde(default, deserialize_with = "deserialize_some")]
    pub agent_type: Option<Option<AgentType>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub planner: Option<Option<PlannerKind>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub tools: Option<Option<BTreeSet<String>>>,
}

/// A full-update patch, mirroring `PUT /agents/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinitionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub personality: Option<String>,
    pub expertise: Option<Vec<String>>,
    pub communication_style: Option<String>,
    pub language: Option<String>,
    pub custom_instructions: Option<String>,
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub sub_agent_ids: Option<Vec<AgentId>>,
    pub metadata: Option<Value>,
}

/// A registered tool's process-wide descriptor (§3 `ToolDescriptor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: String,
    pub version: String,
    pub author: String,
    pub is_enabled: bool,
    pub usage_count: u64,
}

/// A conversation/session (§3 `Conversation`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: SessionId,
    pub user_id: String,
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub message_count: u64,
    pub metadata: Value,
}

/// The role of a [`Message`] author (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

/// The kind of content a [`Message`] carries (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Content,
    ToolCall,
    ToolResponse,
    Thinking,
    Error,
}

/// A single persisted message within a [`Conversation`] (§3).
///
/// Ordering within a session is total and monotonic by `created_at`; see
/// [`crate::core::conversation_manager::ConversationManager::append`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub tool_call_id: Option<String>,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

impl Message {
    /// Construct a new message with `message_id`/`created_at` left for the Conversation
    /// Manager to assign (per §4.5: "Assigns `message_id`, `created_at`").
    pub fn draft(session_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            message_type: MessageType::Content,
            tool_name: None,
            tool_args: None,
            tool_call_id: None,
            is_streaming: false,
            is_complete: true,
            created_at: Utc::now(),
            metadata: Value::Null,
        }
    }
}
