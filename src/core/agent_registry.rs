//! Agent Registry (C3): definitions (write-through to C2) plus the lazily-materialized
//! instance cache.
//!
//! Grounded on `agent.rs`'s `Agent` construction/tool-resolution shape and
//! `orchestration.rs`'s sub-instance handling, generalized to an `AgentDefinition ->
//! AgentInstance` materialization algorithm that builds lazily from a persisted definition
//! rather than eagerly at construction time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{info, warn};
use uuid::Uuid;

use crate::core::config::RuntimeConfig;
use crate::core::error::CoreError;
use crate::core::model::{
    AgentConfigPatch, AgentDefinition, AgentDefinitionPatch, AgentId, AgentType, PlannerKind,
};
use crate::core::persistence::Store;
use crate::core::runner::tokio_util_cancel::CancelHandle;
use crate::core::team_composer::TeamKind;
use crate::core::tool_registry::{ToolCallable, ToolRegistry};
use crate::core::model::ToolDescriptor;

/// The materialized, callable form of an [`AgentDefinition`] (§3 `AgentInstance`). Never
/// persisted; invalidated on definition update or tool rebind.
pub struct AgentInstance {
    pub agent_id: AgentId,
    pub definition_version: u64,
    pub system_prompt: String,
    pub model_id: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    pub planner: PlannerKind,
    /// Bound plain tools, resolved via C1.
    pub tools: Vec<(ToolDescriptor, Arc<dyn ToolCallable>)>,
    /// Bound agent-as-tool references (`agent:<id>`), each recursively materialized.
    pub agent_tools: Vec<(AgentId, Arc<AgentInstance>)>,
    /// Present only for team kinds: the resolved, ordered sub-instances and the composition
    /// kind they execute under (C4).
    pub team: Option<(TeamKind, Vec<Arc<AgentInstance>>)>,
}

impl AgentInstance {
    pub fn is_team(&self) -> bool {
        self.team.is_some()
    }
}

struct CacheEntry {
    version: u64,
    instance: Arc<AgentInstance>,
}

/// Owns agent definitions (write-through to C2) and the instance cache (§4.3).
pub struct AgentRegistry {
    store: Arc<dyn Store>,
    tools: ToolRegistry,
    config: RuntimeConfig,
    definitions: tokio::sync::RwLock<HashMap<AgentId, AgentDefinition>>,
    cache: tokio::sync::RwLock<HashMap<AgentId, CacheEntry>>,
    /// Single-flight locks: one `tokio::sync::Mutex` per agent id currently materializing.
    materializing: tokio::sync::Mutex<HashMap<AgentId, Arc<tokio::sync::Mutex<()>>>>,
    /// Cancellation handles for all active sessions driving a given agent, so `stop(agent_id)`
    /// can cancel every one of them (§4.3, §5).
    active_sessions: tokio::sync::RwLock<HashMap<AgentId, Vec<CancelHandle>>>,
}

/// Errors specific to the Agent Registry, re-exported at the crate root. These are a subset
/// of [`CoreError`]'s variants, surfaced with a narrower type at this API boundary.
pub type AgentRegistryError = CoreError;

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, tools: ToolRegistry, config: RuntimeConfig) -> Self {
        Self {
            store,
            tools,
            config,
            definitions: tokio::sync::RwLock::new(HashMap::new()),
            cache: tokio::sync::RwLock::new(HashMap::new()),
            materializing: tokio::sync::Mutex::new(HashMap::new()),
            active_sessions: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// `create(definition) -> agent_id`. Generates an id if absent, validates, persists, does
    /// NOT materialize (§4.3).
    pub async fn create(&self, mut definition: AgentDefinition) -> Result<AgentId, CoreError> {
        if definition.agent_id.is_empty() {
            definition.agent_id = Uuid::new_v4().to_string();
        }
        self.validate(&definition)?;

        self.store
            .save_agent(&definition)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let agent_id = definition.agent_id.clone();
        let mut definitions = self.definitions.write().await;
        definitions.insert(agent_id.clone(), definition);
        Ok(agent_id)
    }

    fn validate(&self, definition: &AgentDefinition) -> Result<(), CoreError> {
        if definition.agent_type.is_team() && definition.sub_agent_ids.is_empty() {
            return Err(CoreError::Validation(
                "team agent_type requires a non-empty sub_agent_ids".to_string(),
            ));
        }
        if !definition.agent_type.is_team() && !definition.tool_names.is_empty() {
            // Leaf agents may freely have tool_names; only team agents are restricted from
            // exposing them directly (§3 invariant: "team agents have no directly exposed
            // tool_names"). No error for the leaf case.
        }
        if definition.agent_type.is_team() && !definition.tool_names.is_empty() {
            return Err(CoreError::Validation(
                "team agents may not directly expose tool_names".to_string(),
            ));
        }
        Ok(())
    }

    /// `update(agent_id, patch)`. Persists; invalidates the cached instance.
    pub async fn update(
        &self,
        agent_id: &AgentId,
        patch: AgentDefinitionPatch,
    ) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        let def = definitions
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))?;

        if let Some(v) = patch.name {
            def.name = v;
        }
        if let Some(v) = patch.description {
            def.description = v;
        }
        if let Some(v) = patch.personality {
            def.personality = Some(v);
        }
        if let Some(v) = patch.expertise {
            def.expertise = v;
        }
        if let Some(v) = patch.communication_style {
            def.communication_style = Some(v);
        }
        if let Some(v) = patch.language {
            def.language = Some(v);
        }
        if let Some(v) = patch.custom_instructions {
            def.custom_instructions = Some(v);
        }
        if let Some(v) = patch.model_id {
            def.model_id = v;
        }
        if let Some(v) = patch.temperature {
            def.temperature = v;
        }
        if let Some(v) = patch.max_output_tokens {
            def.max_output_tokens = Some(v);
        }
        if let Some(v) = patch.sub_agent_ids {
            def.sub_agent_ids = v;
        }
        if let Some(v) = patch.metadata {
            def.metadata = v;
        }
        def.version += 1;

        self.validate(def)?;
        self.store
            .update_agent(def)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        self.invalidate(agent_id).await;
        Ok(())
    }

    /// `update_config(agent_id, {agent_type?, planner?, tools?})` (§4.3, §6 `PUT
    /// /agents/{id}/config`). Each field is absent (leave unchanged), present-with-`null`
    /// (clear: `agent_type` resets to `Standard`, `planner` to `None`, `tools` to empty), or
    /// present-with-value (set).
    pub async fn update_config(
        &self,
        agent_id: &AgentId,
        patch: AgentConfigPatch,
    ) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        let def = definitions
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))?;

        if let Some(agent_type) = patch.agent_type {
            def.agent_type = agent_type.unwrap_or(AgentType::Standard);
        }
        if let Some(planner) = patch.planner {
            def.planner = planner.unwrap_or(PlannerKind::None);
        }
        if let Some(tools) = patch.tools {
            def.tool_names = tools.unwrap_or_default();
        }
        def.version += 1;

        self.validate(def)?;
        self.store
            .update_agent(def)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        self.invalidate(agent_id).await;
        Ok(())
    }

    /// `delete(agent_id)`. Soft-delete; invalidates the cached instance; does not touch
    /// conversations (§3 ownership).
    pub async fn delete(&self, agent_id: &AgentId) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        let def = definitions
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))?;
        def.is_active = false;
        self.store
            .delete_agent(agent_id)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        drop(definitions);
        self.invalidate(agent_id).await;
        Ok(())
    }

    pub async fn list(&self) -> Vec<AgentDefinition> {
        let definitions = self.definitions.read().await;
        let mut out: Vec<_> = definitions.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub async fn get_definition(&self, agent_id: &AgentId) -> Result<AgentDefinition, CoreError> {
        let definitions = self.definitions.read().await;
        definitions
            .get(agent_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))
    }

    /// `attach_tools(agent_id, names)`. Set-union; persists; invalidates; idempotent (§4.3).
    pub async fn attach_tools(&self, agent_id: &AgentId, names: &[String]) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        let def = definitions
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))?;
        def.tool_names.extend(names.iter().cloned());
        def.version += 1;
        self.store
            .update_agent(def)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        drop(definitions);
        self.invalidate(agent_id).await;
        Ok(())
    }

    /// `detach_tools(agent_id, names)`. Set-difference; idempotent (§4.3).
    pub async fn detach_tools(&self, agent_id: &AgentId, names: &[String]) -> Result<(), CoreError> {
        let mut definitions = self.definitions.write().await;
        let def = definitions
            .get_mut(agent_id)
            .ok_or_else(|| CoreError::NotFound(agent_id.clone()))?;
        for name in names {
            def.tool_names.remove(name);
        }
        def.version += 1;
        self.store
            .update_agent(def)
            .await
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        drop(definitions);
        self.invalidate(agent_id).await;
        Ok(())
    }

    async fn invalidate(&self, agent_id: &AgentId) {
        let mut cache = self.cache.write().await;
        cache.remove(agent_id);
    }

    /// `stop(agent_id)`: cancels every active session driving this agent (§4.3, §5).
    pub async fn stop(&self, agent_id: &AgentId) {
        let mut active = self.active_sessions.write().await;
        if let Some(handles) = active.remove(agent_id) {
            for handle in handles {
                handle.cancel();
            }
        }
    }

    /// Register a cancel handle as "active" for `agent_id` so `stop` can reach it later.
    pub async fn track_session(&self, agent_id: &AgentId, handle: CancelHandle) {
        let mut active = self.active_sessions.write().await;
        active.entry(agent_id.clone()).or_default().push(handle);
    }

    /// `ensure_instance(agent_id) -> AgentInstance` — the sole materialization path (§4.3).
    /// Single-flight per `agent_id`: concurrent callers observe one construction.
    pub async fn ensure_instance(&self, agent_id: &AgentId) -> Result<Arc<AgentInstance>, CoreError> {
        if let Some(entry) = self.cache.read().await.get(agent_id) {
            return Ok(entry.instance.clone());
        }

        let lock = {
            let mut locks = self.materializing.lock().await;
            locks
                .entry(agent_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Re-check after acquiring the single-flight lock: another caller may have finished.
        if let Some(entry) = self.cache.read().await.get(agent_id) {
            return Ok(entry.instance.clone());
        }

        let mut visiting = HashSet::new();
        let instance = Box::pin(self.materialize(agent_id, &mut visiting)).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            agent_id.clone(),
            CacheEntry {
                version: instance.definition_version,
                instance: instance.clone(),
            },
        );
        Ok(instance)
    }

    /// Recursive materialization with cycle detection via a per-call visiting set
    /// (§4.3 step 4, §9 "Cyclic graphs").
    fn materialize<'a>(
        &'a self,
        agent_id: &'a AgentId,
        visiting: &'a mut HashSet<AgentId>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<AgentInstance>, CoreError>> + Send + 'a>>
    {
        Box::pin(async move {
            if !visiting.insert(agent_id.clone()) {
                return Err(CoreError::CyclicAgentTool(agent_id.clone()));
            }

            let definition = {
                let definitions = self.definitions.read().await;
                definitions.get(agent_id).cloned()
            };
            let definition = match definition {
                Some(d) => d,
                None => match self
                    .store
                    .get_agent(agent_id)
                    .await
                    .map_err(|e| CoreError::NotFound(e.to_string()))?
                {
                    Some(d) => {
                        let mut definitions = self.definitions.write().await;
                        definitions.insert(agent_id.clone(), d.clone());
                        d
                    }
                    None => return Err(CoreError::NotFound(agent_id.clone())),
                },
            };
            if !definition.is_active {
                return Err(CoreError::NotFound(agent_id.clone()));
            }

            let system_prompt = build_system_prompt(&definition);

            let plain_names: Vec<String> = definition
                .tool_names
                .iter()
                .filter(|t| !t.starts_with("agent:"))
                .cloned()
                .collect();
            let (resolved, missing) = self.tools.resolve_many(&plain_names).await;
            if !missing.is_empty() {
                return Err(CoreError::ToolUnavailable(missing.join(", ")));
            }

            let mut agent_tools = Vec::new();
            for ref_id in definition.agent_tool_ids() {
                let ref_id = ref_id.to_string();
                let sub = self.materialize(&ref_id, visiting).await?;
                agent_tools.push((ref_id, sub));
            }

            let team = if definition.agent_type.is_team() {
                let kind = match definition.agent_type {
                    AgentType::Sequential => TeamKind::Sequential,
                    AgentType::Parallel => TeamKind::Parallel,
                    AgentType::Hierarchical => TeamKind::Hierarchical,
                    AgentType::Loop => TeamKind::Loop,
                    _ => unreachable!("is_team() guarantees a team variant"),
                };
                let mut sub_instances = Vec::with_capacity(definition.sub_agent_ids.len());
                for sub_id in &definition.sub_agent_ids {
                    let sub = self.materialize(sub_id, visiting).await.map_err(|e| {
                        CoreError::SubAgentUnavailable(format!("{}: {}", sub_id, e))
                    })?;
                    sub_instances.push(sub);
                }
                Some((kind, sub_instances))
            } else {
                None
            };

            visiting.remove(agent_id);

            info!("materialized agent instance {} (v{})", agent_id, definition.version);

            Ok(Arc::new(AgentInstance {
                agent_id: agent_id.clone(),
                definition_version: definition.version,
                system_prompt,
                model_id: definition.model_id.clone(),
                temperature: definition.temperature,
                max_output_tokens: definition.max_output_tokens,
                planner: definition.planner,
                tools: resolved,
                agent_tools,
                team,
            }))
        })
    }
}

/// Compose the system prompt from persona fields, appending the ReAct instruction envelope
/// when `planner = PlanReActPlanner` (§4.3 step 3).
fn build_system_prompt(definition: &AgentDefinition) -> String {
    let mut prompt = String::new();
    if !definition.description.is_empty() {
        prompt.push_str(&definition.description);
        prompt.push('\n');
    }
    if let Some(personality) = &definition.personality {
        prompt.push_str(&format!("Personality: {}\n", personality));
    }
    if !definition.expertise.is_empty() {
        prompt.push_str(&format!("Expertise: {}\n", definition.expertise.join(", ")));
    }
    if let Some(style) = &definition.communication_style {
        prompt.push_str(&format!("Communication style: {}\n", style));
    }
    if let Some(lang) = &definition.language {
        prompt.push_str(&format!("Respond in: {}\n", lang));
    }
    if let Some(custom) = &definition.custom_instructions {
        prompt.push_str(custom);
        prompt.push('\n');
    }

    if definition.planner == PlannerKind::PlanReActPlanner {
        prompt.push_str(
            "\nFollow this structure for every turn:\n\
             /*PLANNING*/ outline your plan before acting.\n\
             /*ACTION*/ invoke at most one tool, or state that none is needed.\n\
             /*REASONING*/ interpret the tool result (or the absence of one).\n\
             /*FINAL_ANSWER*/ give the user-facing answer.\n",
        );
    }

    if prompt.is_empty() {
        warn!("agent {} has an empty system prompt", definition.agent_id);
    }
    prompt
}
