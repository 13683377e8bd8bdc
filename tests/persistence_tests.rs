//! Integration tests for the SQLite-backed `Store` implementation (§4.2).

use agentmesh::core::model::{AgentDefinition, AgentType, Conversation, Message, MessageRole, MessageType};
use agentmesh::core::persistence::{SqliteStore, Store};
use serde_json::Value;

async fn sqlite_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agentmesh.sqlite3");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let store = SqliteStore::connect(&url).await.unwrap();
    (store, dir)
}

fn conversation(session_id: &str, agent_id: &str) -> Conversation {
    let now = chrono::Utc::now();
    Conversation {
        session_id: session_id.to_string(),
        user_id: "user-1".to_string(),
        agent_id: agent_id.to_string(),
        created_at: now,
        updated_at: now,
        is_active: true,
        message_count: 0,
        metadata: Value::Null,
    }
}

#[tokio::test]
async fn agent_crud_round_trips_through_sqlite() {
    let (store, _dir) = sqlite_store().await;

    let mut agent = AgentDefinition::new("agent-1", "Assistant", "echo-model");
    agent.agent_type = AgentType::Standard;
    agent.tool_names.insert("search".to_string());
    store.save_agent(&agent).await.unwrap();

    let fetched = store.get_agent("agent-1").await.unwrap().expect("agent should exist");
    assert_eq!(fetched.name, "Assistant");
    assert_eq!(fetched.tool_names, agent.tool_names);

    let mut updated = fetched.clone();
    updated.name = "Assistant v2".to_string();
    updated.is_active = true;
    store.update_agent(&updated).await.unwrap();

    let refetched = store.get_agent("agent-1").await.unwrap().unwrap();
    assert_eq!(refetched.name, "Assistant v2");
    assert_eq!(refetched.version, fetched.version + 1, "update_agent bumps version in SQL");

    let listed = store.list_agents(true, 10, 0).await.unwrap();
    assert_eq!(listed.len(), 1);

    store.delete_agent("agent-1").await.unwrap();
    let after_delete = store.get_agent("agent-1").await.unwrap().expect("soft delete keeps the row");
    assert!(!after_delete.is_active);
    let active_listed = store.list_agents(true, 10, 0).await.unwrap();
    assert!(active_listed.is_empty());
}

#[tokio::test]
async fn append_message_and_touch_conversation_is_transactional() {
    let (store, _dir) = sqlite_store().await;

    let convo = conversation("session-1", "agent-1");
    store.save_conversation(&convo).await.unwrap();

    let mut message = Message::draft("session-1", MessageRole::User, "hello");
    message.message_id = "msg-1".to_string();
    message.message_type = MessageType::Content;

    let mut touched = convo.clone();
    touched.message_count = 1;
    store.append_message_and_touch_conversation(&message, &touched).await.unwrap();

    let messages = store.list_messages_by_session("session-1", true).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");

    let count = store.count_messages_by_session("session-1").await.unwrap();
    assert_eq!(count, 1);

    let reloaded = store.get_conversation("session-1").await.unwrap().unwrap();
    assert_eq!(reloaded.message_count, 1, "the conversation row must be touched in the same transaction");
}

#[tokio::test]
async fn delete_conversation_cascades_to_messages() {
    let (store, _dir) = sqlite_store().await;

    let convo = conversation("session-2", "agent-1");
    store.save_conversation(&convo).await.unwrap();

    let mut message = Message::draft("session-2", MessageRole::User, "hi");
    message.message_id = "msg-2".to_string();
    store.append_message_and_touch_conversation(&message, &convo).await.unwrap();

    store.delete_conversation("session-2").await.unwrap();

    assert!(store.get_conversation("session-2").await.unwrap().is_none());
    assert_eq!(store.count_messages_by_session("session-2").await.unwrap(), 0);
}
