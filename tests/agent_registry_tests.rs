//! Integration tests for the Agent Registry (§4.3, §8 "Cycle rejection",
//! "Attach/detach idempotence").

use std::sync::Arc;

use agentmesh::core::agent_registry::AgentRegistry;
use agentmesh::core::model::AgentDefinition;
use agentmesh::core::persistence;
use agentmesh::core::tool_registry::ToolRegistry;
use agentmesh::{CoreError, RuntimeConfig};

async fn registry() -> AgentRegistry {
    let store = persistence::connect(None).await;
    let tools = ToolRegistry::new();
    AgentRegistry::new(store, tools, RuntimeConfig::default())
}

#[tokio::test]
async fn cyclic_agent_tool_reference_is_rejected_and_nothing_is_cached() {
    let registry = registry().await;

    let mut a = AgentDefinition::new("a", "A", "echo-model");
    a.tool_names.insert("agent:b".to_string());
    let mut b = AgentDefinition::new("b", "B", "echo-model");
    b.tool_names.insert("agent:a".to_string());

    registry.create(a).await.unwrap();
    registry.create(b).await.unwrap();

    let err = registry.ensure_instance(&"a".to_string()).await.unwrap_err();
    assert!(matches!(err, CoreError::CyclicAgentTool(_)), "expected CyclicAgentTool, got {:?}", err);

    let err_again = registry.ensure_instance(&"a".to_string()).await.unwrap_err();
    assert!(matches!(err_again, CoreError::CyclicAgentTool(_)), "the cycle must be rejected consistently, nothing should have been cached");
}

#[tokio::test]
async fn attach_tools_is_idempotent() {
    let registry = registry().await;
    let agent_id = registry
        .create(AgentDefinition::new("leaf", "Leaf", "echo-model"))
        .await
        .unwrap();

    let names = vec!["search".to_string(), "calculator".to_string()];
    registry.attach_tools(&agent_id, &names).await.unwrap();
    let once = registry.get_definition(&agent_id).await.unwrap().tool_names;

    registry.attach_tools(&agent_id, &names).await.unwrap();
    let twice = registry.get_definition(&agent_id).await.unwrap().tool_names;

    assert_eq!(once, twice);
    assert_eq!(once.len(), 2);
}

#[tokio::test]
async fn detach_tools_is_idempotent() {
    let registry = registry().await;
    let agent_id = registry
        .create(AgentDefinition::new("leaf2", "Leaf2", "echo-model"))
        .await
        .unwrap();

    let names = vec!["search".to_string(), "calculator".to_string()];
    registry.attach_tools(&agent_id, &names).await.unwrap();

    registry.detach_tools(&agent_id, &["search".to_string()]).await.unwrap();
    let once = registry.get_definition(&agent_id).await.unwrap().tool_names;

    registry.detach_tools(&agent_id, &["search".to_string()]).await.unwrap();
    let twice = registry.get_definition(&agent_id).await.unwrap().tool_names;

    assert_eq!(once, twice);
    assert_eq!(once.len(), 1);
}

#[tokio::test]
async fn a_missing_tool_is_reported_as_tool_unavailable() {
    let registry = registry().await;
    let agent_id = registry
        .create(AgentDefinition::new("leaf3", "Leaf3", "echo-model"))
        .await
        .unwrap();
    registry.attach_tools(&agent_id, &["nonexistent_tool".to_string()]).await.unwrap();

    let err = registry.ensure_instance(&agent_id).await.unwrap_err();
    assert!(matches!(err, CoreError::ToolUnavailable(_)));
}
