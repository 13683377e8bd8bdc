//! HTTP/SSE Surface (C8): a thin REST + Server-Sent-Events adapter over §§4.1-4.7.
//!
//! Grounded on `mcp_server_builder.rs`/`mcp_http_adapter.rs`'s `MCPServerBuilder`/
//! `AxumHttpAdapter` pair: a builder that owns the shared state and a pluggable HTTP backend,
//! here narrowed to a single concrete `axum` router since there's no need for adapter-swap
//! indirection. Bearer/API-key comparison follows `mcp_server_builder_utils.rs`'s
//! `AuthConfig::validate` (SHA-256 digest + `subtle::ConstantTimeEq`, so the optimizer can't
//! short-circuit the comparison the way it can with `==`).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::core::agent_registry::AgentRegistry;
use crate::core::conversation_manager::ConversationManager;
use crate::core::error::CoreError;
use crate::core::model::{AgentConfigPatch, AgentDefinition, AgentDefinitionPatch, AgentId, SessionId};
use crate::core::streaming::StreamingHandler;
use crate::core::tool_registry::ToolRegistry;

/// Shared application state, cloned cheaply into every handler (every field is `Arc`- or
/// `RwLock`-backed internally).
#[derive(Clone)]
pub struct AppState {
    pub agents: Arc<AgentRegistry>,
    pub tools: ToolRegistry,
    pub conversations: Arc<ConversationManager>,
    pub streaming: Arc<StreamingHandler>,
    pub auth: Arc<AuthStore>,
}

/// Build the full router: `/auth/*` is open, everything else requires a valid bearer token or
/// API key (§6 "Authentication").
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/agents", post(create_agent).get(list_agents))
        .route("/agents/{id}", get(get_agent).put(update_agent).delete(delete_agent))
        .route("/agents/{id}/config", put(update_agent_config))
        .route("/agents/{id}/tools/attach", post(attach_tools))
        .route("/agents/{id}/tools/detach", post(detach_tools))
        .route("/agents/{id}/stop", post(stop_agent))
        .route("/tools", get(list_tools))
        .route("/conversations/start", post(start_conversation))
        .route("/conversations/{session_id}", get(get_conversation).delete(delete_conversation))
        .route("/conversations/agent/{agent_id}", get(list_conversations_by_agent))
        .route("/streaming/start", post(streaming_start))
        .route("/streaming/send", post(streaming_send))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/api-keys", post(create_api_key))
        .merge(protected)
        .with_state(state)
}

async fn auth_middleware(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|h| state.auth.validate(h).is_some())
        .unwrap_or(false);
    if !authorized {
        return ApiError::unauthorized().into_response();
    }
    next.run(req).await
}

/// A REST-facing error body, shaped after §7's error kind table.
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self { status: StatusCode::UNAUTHORIZED, kind: "unauthorized", message: "missing or invalid credentials".into() }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self { status, kind: err.kind(), message: err.to_string() }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ApiError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, kind: "runner_internal", message: err.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": { "kind": self.kind, "message": self.message } });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn create_agent(State(state): State<AppState>, Json(def): Json<AgentDefinition>) -> ApiResult<impl IntoResponse> {
    let agent_id = state.agents.create(def).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "agent_id": agent_id }))))
}

#[derive(Deserialize)]
struct ListAgentsQuery {
    active_only: Option<bool>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_agents(State(state): State<AppState>, Query(q): Query<ListAgentsQuery>) -> Json<Vec<AgentDefinition>> {
    let mut defs = state.agents.list().await;
    if q.active_only.unwrap_or(false) {
        defs.retain(|d| d.is_active);
    }
    let offset = q.offset.unwrap_or(0) as usize;
    let limit = q.limit.unwrap_or(defs.len() as u32) as usize;
    Json(defs.into_iter().skip(offset).take(limit).collect())
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<AgentId>) -> ApiResult<Json<AgentDefinition>> {
    Ok(Json(state.agents.get_definition(&id).await?))
}

async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(patch): Json<AgentDefinitionPatch>,
) -> ApiResult<StatusCode> {
    state.agents.update(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_agent_config(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(patch): Json<AgentConfigPatch>,
) -> ApiResult<StatusCode> {
    state.agents.update_config(&id, patch).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_agent(State(state): State<AppState>, Path(id): Path<AgentId>) -> ApiResult<StatusCode> {
    state.agents.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ToolNamesBody {
    tool_names: Vec<String>,
}

async fn attach_tools(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(body): Json<ToolNamesBody>,
) -> ApiResult<StatusCode> {
    state.agents.attach_tools(&id, &body.tool_names).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_tools(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(body): Json<ToolNamesBody>,
) -> ApiResult<StatusCode> {
    state.agents.detach_tools(&id, &body.tool_names).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_agent(State(state): State<AppState>, Path(id): Path<AgentId>) -> StatusCode {
    state.agents.stop(&id).await;
    StatusCode::NO_CONTENT
}

async fn list_tools(State(state): State<AppState>) -> Json<Vec<crate::core::model::ToolDescriptor>> {
    Json(state.tools.list(false).await)
}

#[derive(Deserialize)]
struct StartConversationBody {
    user_id: String,
    agent_id: AgentId,
    message: Option<String>,
    /// Accepted for forward compatibility with richer session priming; this adapter stays
    /// thin and does not interpret it.
    #[allow(dead_code)]
    context: Option<Value>,
}

async fn start_conversation(State(state): State<AppState>, Json(body): Json<StartConversationBody>) -> ApiResult<Json<Value>> {
    let session_id = state
        .conversations
        .start(&body.user_id, &body.agent_id, body.message)
        .await?;
    Ok(Json(serde_json::json!({ "session_id": session_id })))
}

async fn get_conversation(State(state): State<AppState>, Path(session_id): Path<SessionId>) -> ApiResult<Json<Value>> {
    let (conversation, messages) = state.conversations.get(&session_id).await?;
    Ok(Json(serde_json::json!({ "conversation": conversation, "messages": messages })))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_conversations_by_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<AgentId>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Value>> {
    let conversations = state
        .conversations
        .list_by_agent(&agent_id, q.limit.unwrap_or(50), q.offset.unwrap_or(0))
        .await?;
    Ok(Json(serde_json::json!(conversations)))
}

async fn delete_conversation(State(state): State<AppState>, Path(session_id): Path<SessionId>) -> ApiResult<StatusCode> {
    state.conversations.delete(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SessionIdQuery {
    session_id: SessionId,
}

/// `POST /streaming/start?session_id=…`: open an SSE stream for a session with no side
/// effects of its own. Each `data:` line is a [`StreamEvent`]; the terminal sentinel is
/// `data: [DONE]\n\n` (§6 "SSE frame format").
async fn streaming_start(
    State(state): State<AppState>,
    Query(q): Query<SessionIdQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.streaming.subscribe(&q.session_id).await;
    Sse::new(subscriber_stream(rx)).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct StreamingSendBody {
    message: String,
    #[allow(dead_code)]
    stream: bool,
}

/// `POST /streaming/send?session_id=…`: subscribes before driving the turn so no event is
/// lost to a race, then drives the turn in the background and forwards its events as the
/// response body (§4 control flow, §4.7 taxonomy).
async fn streaming_send(
    State(state): State<AppState>,
    Query(q): Query<SessionIdQuery>,
    Json(body): Json<StreamingSendBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (conversation, _) = state.conversations.get(&q.session_id).await?;
    let agent_id = conversation.agent_id.clone();
    let rx = state.streaming.subscribe(&q.session_id).await;

    let streaming = state.streaming.clone();
    let session_id = q.session_id.clone();
    tokio::spawn(async move {
        if let Err(err) = streaming.send(&session_id, &agent_id, body.message).await {
            log::error!("turn failed for session {}: {}", session_id, err);
        }
    });

    Ok(Sse::new(subscriber_stream(rx)).keep_alive(KeepAlive::default()))
}

fn subscriber_stream(
    rx: tokio::sync::broadcast::Receiver<crate::core::streaming::StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    tokio_stream::wrappers::BroadcastStream::new(rx).flat_map(|item| {
        let events: Vec<Result<Event, Infallible>> = match item {
            Ok(event) => {
                let is_complete = event.event_type == crate::core::streaming::StreamEventType::Complete;
                let data = serde_json::to_string(&event).unwrap_or_else(|_| "null".to_string());
                let mut out = vec![Ok(Event::default().data(data))];
                if is_complete {
                    out.push(Ok(Event::default().data("[DONE]")));
                }
                out
            }
            // A lagged subscriber missed events; nothing sane to forward for the gap.
            Err(_lagged) => Vec::new(),
        };
        futures_util::stream::iter(events)
    })
}

#[derive(Deserialize)]
struct LoginBody {
    user_id: String,
}

#[derive(Serialize)]
struct LoginResponse {
    token: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginBody>) -> Json<LoginResponse> {
    let token = state.auth.issue_bearer_token(body.user_id);
    Json(LoginResponse { token })
}

#[derive(Deserialize)]
struct CreateApiKeyBody {
    owner: String,
}

#[derive(Serialize)]
struct CreateApiKeyResponse {
    api_key: String,
}

async fn create_api_key(State(state): State<AppState>, Json(body): Json<CreateApiKeyBody>) -> Json<CreateApiKeyResponse> {
    let api_key = state.auth.issue_api_key(body.owner);
    Json(CreateApiKeyResponse { api_key })
}

/// In-memory bearer/API-key credential store. Grounded on `mcp_server_builder_utils.rs`'s
/// `AuthConfig::validate`: digests are compared with `subtle::ConstantTimeEq` rather than `==`
/// so a timing side-channel can't narrow down a valid secret one byte at a time.
pub struct AuthStore {
    bearer_tokens: RwLock<HashMap<Vec<u8>, String>>,
    api_keys: RwLock<HashMap<Vec<u8>, String>>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self {
            bearer_tokens: RwLock::new(HashMap::new()),
            api_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn issue_bearer_token(&self, user_id: String) -> String {
        let token = Uuid::new_v4().to_string();
        let mut tokens = self.bearer_tokens.write().unwrap();
        tokens.insert(digest(&token), user_id);
        token
    }

    pub fn issue_api_key(&self, owner: String) -> String {
        let key = Uuid::new_v4().to_string();
        let mut keys = self.api_keys.write().unwrap();
        keys.insert(digest(&key), owner);
        key
    }

    /// Validate an `Authorization` header against either credential store, returning the
    /// resolved identity on success (§6: "the user identity is resolved before handler
    /// dispatch").
    pub fn validate(&self, header: &str) -> Option<String> {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let provided = digest(token);
            let tokens = self.bearer_tokens.read().unwrap();
            return find_constant_time(&tokens, &provided);
        }
        if let Some(key) = header.strip_prefix("ApiKey ") {
            let provided = digest(key);
            let keys = self.api_keys.read().unwrap();
            return find_constant_time(&keys, &provided);
        }
        None
    }
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

fn digest(input: &str) -> Vec<u8> {
    Sha256::digest(input.as_bytes()).to_vec()
}

/// Compares `provided` against every stored digest with `ct_eq`, never short-circuiting on
/// the first mismatch, so that lookup time doesn't leak which (if any) entry almost matched.
fn find_constant_time(table: &HashMap<Vec<u8>, String>, provided: &[u8]) -> Option<String> {
    let mut found = None;
    for (candidate, owner) in table.iter() {
        if candidate.as_slice().ct_eq(provided).into() {
            found = Some(owner.clone());
        }
    }
    found
}
