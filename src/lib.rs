// src/lib.rs

//! `agentmesh` is a multi-agent orchestration runtime: it hosts configurable LLM-backed
//! agents, composes them into sequential / parallel / hierarchical / loop execution graphs,
//! streams their execution as a well-defined event taxonomy, and persists agents,
//! conversations, and messages durably (with graceful degradation when persistence is
//! unavailable).

pub mod core;

pub use core::agent_registry::{AgentRegistry, AgentRegistryError};
pub use core::config::RuntimeConfig;
pub use core::conversation_manager::{ConversationManager, ConversationManagerError};
pub use core::error::CoreError;
pub use core::model::{
    AgentDefinition, AgentId, AgentType, Conversation, Message, MessageRole, MessageType,
    PlannerKind, SessionId, ToolDescriptor,
};
pub use core::reference_runner::EchoRunner;
pub use core::runner::{RawEvent, Runner};
pub use core::streaming::{StreamEvent, StreamEventType, StreamingHandler};
pub use core::tool_registry::{ToolError, ToolRegistry};
