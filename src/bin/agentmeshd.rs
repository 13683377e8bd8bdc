//! `agentmeshd`: the HTTP/SSE front door (C8) wired up to the rest of the runtime.
//!
//! Grounded on `mcp_http_adapter.rs`'s bind-and-serve shape (`TcpListener::bind` then
//! `axum::serve`). Ships with [`agentmesh::EchoRunner`] as its default `Runner` since the LLM
//! execution engine itself is an external collaborator (§1); point a real deployment at a
//! different `Runner` implementation by constructing `AppState` directly instead of running
//! this binary.

use std::sync::Arc;

use agentmesh::core::agent_registry::AgentRegistry;
use agentmesh::core::conversation_manager::ConversationManager;
use agentmesh::core::http::{self, AppState, AuthStore};
use agentmesh::core::persistence;
use agentmesh::core::streaming::StreamingHandler;
use agentmesh::core::tool_registry::ToolRegistry;
use agentmesh::{EchoRunner, RuntimeConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RuntimeConfig::from_env();
    let bind_addr = config.bind_addr;
    let config = Arc::new(config);

    let store = persistence::connect(config.database_url.as_deref()).await;
    let tools = ToolRegistry::new();
    let agents = Arc::new(AgentRegistry::new(store.clone(), tools.clone(), (*config).clone()));
    let conversations = Arc::new(ConversationManager::new(store));
    let runner = Arc::new(EchoRunner);
    let streaming = Arc::new(StreamingHandler::new(
        agents.clone(),
        conversations.clone(),
        runner,
        config.clone(),
    ));

    let state = AppState {
        agents,
        tools,
        conversations,
        streaming,
        auth: Arc::new(AuthStore::new()),
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("agentmeshd listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
