//! Team Composer (C4): builds a single executable from an ordered set of resolved
//! sub-instances and a composition kind (sequential / parallel / hierarchical / loop).
//!
//! Grounded on `orchestration.rs`'s `Orchestration::execute_parallel` (tokio::spawn fan-out
//! over forked agents), `execute_round_robin` (sequential turn-taking with message cursors),
//! `execute_hierarchical`, and `execute_ralph` (iterate-until-completion-marker, generalized
//! here into `loop`), rebuilt to emit this system's [`RawEvent`] taxonomy tagged with
//! originating agent id instead of `OrchestrationMessage`/`AgentEvent`.

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use tokio::sync::mpsc;

use crate::core::agent_registry::AgentInstance;
use crate::core::config::RuntimeConfig;
use crate::core::conversation_manager::TurnContext;
use crate::core::model::AgentId;
use crate::core::runner::tokio_util_cancel::CancelSignal;
use crate::core::runner::{RawEvent, Runner};

/// Composition kinds (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamKind {
    Sequential,
    Parallel,
    Hierarchical,
    Loop,
}

/// One event tagged with the sub-agent that produced it, so clients can attribute output in
/// team compositions (§4.4, §4.7 step 7 "team event tagging").
pub type TaggedEvent = (AgentId, RawEvent);

/// Drive `instance` for one turn, returning a channel receiver of tagged events. Leaf
/// instances yield a single sub-stream tagged with their own id; team instances recurse per
/// [`TeamKind`] and multiplex their children's tagged streams into one channel.
pub fn run_instance(
    instance: Arc<AgentInstance>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
) -> mpsc::Receiver<TaggedEvent> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        drive(instance, runner, turn_context, cancel, config, tx).await;
    });
    rx
}

fn drive(
    instance: Arc<AgentInstance>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        match &instance.team {
            None => drive_leaf(instance, runner, turn_context, cancel, config, tx).await,
            Some((TeamKind::Sequential, subs)) => {
                drive_sequential(subs.clone(), runner, turn_context, cancel, config, tx).await
            }
            Some((TeamKind::Parallel, subs)) => {
                drive_parallel(subs.clone(), runner, turn_context, cancel, config, tx).await
            }
            Some((TeamKind::Hierarchical, subs)) => {
                drive_hierarchical(instance.clone(), subs.clone(), runner, turn_context, cancel, config, tx)
                    .await
            }
            Some((TeamKind::Loop, subs)) => {
                drive_loop(subs.clone(), runner, turn_context, cancel, config, tx).await
            }
        }
    })
}

/// A leaf agent's turn is simply the Runner's stream, tagged with its own id. If the Runner
/// invokes an `agent:<id>` tool, that invocation is resolved recursively here so the caller
/// never has to special-case it (§9 "Agents-as-tools ... perform resolution in C3").
async fn drive_leaf(
    instance: Arc<AgentInstance>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) {
    use futures_util::StreamExt;

    let agent_tools: HashMap<AgentId, Arc<AgentInstance>> = instance
        .agent_tools
        .iter()
        .cloned()
        .collect();

    let mut stream = match runner.run(&instance, &turn_context, cancel.clone()).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = tx
                .send((
                    instance.agent_id.clone(),
                    RawEvent::Error {
                        kind: "runner_internal".to_string(),
                        message: err.to_string(),
                    },
                ))
                .await;
            return;
        }
    };

    while let Some(event) = stream.next().await {
        if let RawEvent::ToolInvocation { name, args, call_id } = &event {
            if let Some(sub_id) = name.strip_prefix("agent:") {
                if let Some(sub_instance) = agent_tools.get(sub_id) {
                    let _ = tx.send((instance.agent_id.clone(), event.clone())).await;
                    let sub_turn = TurnContext {
                        session_id: turn_context.session_id.clone(),
                        agent_id: sub_instance.agent_id.clone(),
                        history: turn_context.history.clone(),
                        user_turn: args.to_string(),
                    };
                    let result_text = run_and_collect_final(
                        sub_instance.clone(),
                        runner.clone(),
                        sub_turn,
                        cancel.clone(),
                        config.clone(),
                        &tx,
                    )
                    .await;
                    let _ = tx
                        .send((
                            instance.agent_id.clone(),
                            RawEvent::ToolResult {
                                call_id: call_id.clone(),
                                payload: result_text,
                            },
                        ))
                        .await;
                    continue;
                }
            }
        }
        let _ = tx.send((instance.agent_id.clone(), event)).await;
    }
}

/// Run a sub-instance to completion, forwarding its tagged events to `tx` and returning its
/// final accumulated text (used both by hierarchical agent-as-tool invocation and by
/// sequential/loop step chaining).
async fn run_and_collect_final(
    instance: Arc<AgentInstance>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: &mpsc::Sender<TaggedEvent>,
) -> String {
    let (inner_tx, mut inner_rx) = mpsc::channel(256);
    drive(instance, runner, turn_context, cancel, config, inner_tx).await;

    let mut acc = String::new();
    while let Some((origin, event)) = inner_rx.recv().await {
        match &event {
            RawEvent::PartialText(delta) => acc.push_str(delta),
            RawEvent::Final(text) => {
                if !text.trim().is_empty() {
                    acc = text.clone();
                }
            }
            _ => {}
        }
        let _ = tx.send((origin, event)).await;
    }
    acc
}

/// **sequential**: step *k*'s output is appended to step *k+1*'s input context; the final
/// step's output is the team's output. A failure at step *k* terminates the pipeline; steps
/// beyond *k* do not run (§4.4).
async fn drive_sequential(
    subs: Vec<Arc<AgentInstance>>,
    runner: Arc<dyn Runner>,
    mut turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) {
    for sub in subs {
        let sub_id = sub.agent_id.clone();
        let step_context = turn_context.clone();
        let final_text = run_and_collect_final(
            sub,
            runner.clone(),
            step_context,
            cancel.clone(),
            config.clone(),
            &tx,
        )
        .await;
        if cancel.is_cancelled() {
            let _ = tx
                .send((sub_id, RawEvent::Error { kind: "cancelled".to_string(), message: "cancelled".to_string() }))
                .await;
            return;
        }
        turn_context.user_turn = format!("{}\n\n{}", turn_context.user_turn, final_text);
    }
}

/// **parallel**: all sub-instances run concurrently on the same input; a bounded merge
/// channel (`tx`, shared by every spawned task) fans their tagged events into one stream. A
/// child error is surfaced as a tagged `error` event; other children continue. The composite
/// completes only once every child has terminated (§4.4, testable property "Parallel
/// completion").
async fn drive_parallel(
    subs: Vec<Arc<AgentInstance>>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) {
    let mut handles = Vec::with_capacity(subs.len());
    for sub in subs {
        let runner = runner.clone();
        let turn_context = turn_context.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            drive_leaf(sub, runner, turn_context, cancel, config, tx).await;
        }));
    }

    let grace = std::time::Duration::from_millis(config.parallel_cancel_grace_ms);
    for handle in handles {
        if tokio::time::timeout(grace * 4, handle).await.is_err() {
            warn!("parallel team child did not terminate within grace period");
        }
    }
}

/// **hierarchical**: the first sub-instance is the coordinator and is driven as a leaf; the
/// remaining sub-instances are already present in `agent_tools` on a leaf instance, or are
/// supplied here as additional resolvable `agent:<id>` bindings if the coordinator's own
/// definition didn't declare them directly. The coordinator may invoke each zero or more
/// times, surfaced as `tool_call`/`tool_response` pairs (§4.4).
async fn drive_hierarchical(
    _team_instance: Arc<AgentInstance>,
    subs: Vec<Arc<AgentInstance>>,
    runner: Arc<dyn Runner>,
    turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) {
    let mut subs = subs;
    if subs.is_empty() {
        return;
    }
    let coordinator = subs.remove(0);
    let children: Vec<(AgentId, Arc<AgentInstance>)> = subs
        .into_iter()
        .map(|s| (s.agent_id.clone(), s))
        .collect();

    // Coordinator cycle-prevention (§4.4 "hierarchical cycles") is enforced upstream in
    // AgentRegistry::materialize via the shared visiting set; here we only need to give the
    // coordinator the sibling bindings it doesn't already carry.
    let coordinator = Arc::new(AgentInstance {
        agent_id: coordinator.agent_id.clone(),
        definition_version: coordinator.definition_version,
        system_prompt: coordinator.system_prompt.clone(),
        model_id: coordinator.model_id.clone(),
        temperature: coordinator.temperature,
        max_output_tokens: coordinator.max_output_tokens,
        planner: coordinator.planner,
        tools: coordinator.tools.clone(),
        agent_tools: {
            let mut merged = coordinator.agent_tools.clone();
            merged.extend(children);
            merged
        },
        team: None,
    });

    drive_leaf(coordinator, runner, turn_context, cancel, config, tx).await;
}

/// **loop**: run sub-instances in order; after the last, re-enter the first. Terminates early
/// if a sub-instance's output contains [`RuntimeConfig::termination_marker`], or after
/// `MAX_LOOP_ITERATIONS` rounds, whichever comes first (§4.4, §9 Open Question resolution).
async fn drive_loop(
    subs: Vec<Arc<AgentInstance>>,
    runner: Arc<dyn Runner>,
    mut turn_context: TurnContext,
    cancel: CancelSignal,
    config: Arc<RuntimeConfig>,
    tx: mpsc::Sender<TaggedEvent>,
) {
    if subs.is_empty() {
        return;
    }
    let mut invocations = 0usize;
    let max_invocations = config.max_loop_iterations * subs.len();

    'outer: for _round in 0..config.max_loop_iterations {
        for sub in &subs {
            if cancel.is_cancelled() {
                return;
            }
            invocations += 1;
            if invocations > max_invocations {
                break 'outer;
            }
            let step_context = turn_context.clone();
            let final_text = run_and_collect_final(
                sub.clone(),
                runner.clone(),
                step_context,
                cancel.clone(),
                config.clone(),
                &tx,
            )
            .await;
            if final_text.contains(&config.termination_marker) {
                return;
            }
            turn_context.user_turn = format!("{}\n\n{}", turn_context.user_turn, final_text);
        }
    }

    let _ = tx
        .send((
            subs[0].agent_id.clone(),
            RawEvent::Error {
                kind: "loop_exhausted".to_string(),
                message: format!(
                    "reached MAX_LOOP_ITERATIONS ({})",
                    config.max_loop_iterations
                ),
            },
        ))
        .await;
}
