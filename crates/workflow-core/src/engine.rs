//! The engine: drives in-flight workflow executions against a [`Bus`],
//! dispatching ready nodes, routing inbound responses to the right node or
//! control handler, and finalizing to a terminal success/failure task.
//! `spec.md` §4.4-§4.9.
//!
//! `Engine<B>` is generic over the bus rather than holding `Arc<dyn Bus>`:
//! `Bus`'s async methods use return-position `impl Future`, which isn't
//! object-safe. Workflows are independent: each gets its own
//! `Arc<tokio::sync::Mutex<WorkflowHandle>>`, so dispatching one workflow
//! never blocks another — only the (brief) `active_workflows`/
//! `sub_task_index` lookups are serialized, mirroring the donor engine's
//! per-run isolation with a process-wide registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::artifact::{ArtifactKey, ArtifactService};
use crate::bus::{
    find_node_result, Bus, InboundMessage, MessagePart, NodeResultStatus, TerminalTask, Topics, UserProperties,
};
use crate::config::EngineConfig;
use crate::context::{A2aContext, CancellationToken, ExecutionContext};
use crate::control::{conditional, fork, join, loop_node, map, propagate_skip, switch};
use crate::dag::Dag;
use crate::dispatch::{self, mint_sub_task_id};
use crate::error::{Result, WorkflowError};
use crate::model::{WorkflowDefinition, WorkflowNode};
use crate::progress::{observer_topic, ProgressEvent, ProgressKind, ProgressSink};
use crate::registry::AgentRegistry;
use crate::resolve::{evaluate_condition, resolve_map, resolve_value};
use crate::state::{Completion, ErrorState, ExecutionState, SkipReason, Tracker};

/// Everything the engine needs about one in-flight execution besides the
/// handful of process-wide services held by [`Engine`] itself.
struct WorkflowHandle {
    workflow_name: String,
    dag: Dag,
    definition: WorkflowDefinition,
    state: ExecutionState,
    context: ExecutionContext,
    deadline: Instant,
    sub_task_deadlines: HashMap<String, Instant>,
}

type SharedHandle = Arc<AsyncMutex<WorkflowHandle>>;

/// Drives one or more workflow executions against a `B: Bus`.
pub struct Engine<B: Bus> {
    bus: Arc<B>,
    artifacts: Arc<dyn ArtifactService>,
    registry: Arc<AgentRegistry>,
    config: EngineConfig,
    topics: Arc<Topics>,
    progress: Option<Arc<ProgressSink>>,
    active_workflows: Arc<AsyncMutex<HashMap<String, SharedHandle>>>,
    sub_task_index: Arc<AsyncMutex<HashMap<String, String>>>,
}

impl<B: Bus> Clone for Engine<B> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            artifacts: self.artifacts.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            topics: self.topics.clone(),
            progress: self.progress.clone(),
            active_workflows: self.active_workflows.clone(),
            sub_task_index: self.sub_task_index.clone(),
        }
    }
}

impl<B: Bus + 'static> Engine<B> {
    pub fn new(
        bus: Arc<B>,
        artifacts: Arc<dyn ArtifactService>,
        registry: Arc<AgentRegistry>,
        config: EngineConfig,
        progress: Option<Arc<ProgressSink>>,
    ) -> Self {
        let topics = Arc::new(Topics::new(config.namespace.clone()));
        Self {
            bus,
            artifacts,
            registry,
            config,
            topics,
            progress,
            active_workflows: Arc::new(AsyncMutex::new(HashMap::new())),
            sub_task_index: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    /// Run the engine's main loop: poll the bus for inbound responses and
    /// sweep for timed-out nodes/workflows. Returns once the bus closes.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                maybe_msg = self.bus.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if let Err(e) = self.handle_inbound(msg).await {
                                warn!(error = %e, "failed to handle inbound bus message");
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = ticker.tick() => {
                    self.sweep_timeouts().await;
                }
            }
        }
    }

    /// Register a new execution, subscribe to its response topic, and run
    /// the dispatch loop to its first fixed point. Returns the minted
    /// execution id.
    pub async fn submit(
        &self,
        workflow_name: impl Into<String>,
        definition: WorkflowDefinition,
        input: Value,
        a2a_context: A2aContext,
    ) -> Result<String> {
        let workflow_name = workflow_name.into();
        let dag = Dag::build(&definition)?;
        let execution_id = mint_execution_id();
        let state = ExecutionState::new(workflow_name.clone(), execution_id.clone(), input);
        let context = ExecutionContext::new(a2a_context.logical_task_id.clone(), a2a_context);
        let deadline = Instant::now() + Duration::from_secs(self.config.max_workflow_execution_time_seconds);

        let handle: SharedHandle = Arc::new(AsyncMutex::new(WorkflowHandle {
            workflow_name: workflow_name.clone(),
            dag,
            definition,
            state,
            context,
            deadline,
            sub_task_deadlines: HashMap::new(),
        }));

        self.active_workflows.lock().await.insert(execution_id.clone(), handle.clone());
        self.bus.subscribe(&self.topics.response_wildcard(&workflow_name)).await?;

        self.pump(&execution_id, &handle).await?;
        Ok(execution_id)
    }

    /// Whether `execution_id` is still tracked as in-flight. A CLI or other
    /// embedder that called `submit` can poll this to learn when a specific
    /// execution has finalized, without needing its own bus subscription.
    pub async fn is_active(&self, execution_id: &str) -> bool {
        self.active_workflows.lock().await.contains_key(execution_id)
    }

    async fn handle_inbound(&self, msg: InboundMessage) -> Result<()> {
        let Some(sub_task_id) = Topics::sub_task_id_from_topic(&msg.topic).map(str::to_string) else {
            warn!(topic = %msg.topic, "inbound message on an unparseable topic, dropping");
            return Ok(());
        };

        let execution_id = { self.sub_task_index.lock().await.get(&sub_task_id).cloned() };
        let Some(execution_id) = execution_id else {
            debug!(sub_task_id, "response for an unknown or already-settled sub-task, dropping");
            return Ok(());
        };

        let handle = { self.active_workflows.lock().await.get(&execution_id).cloned() };
        let Some(handle) = handle else {
            return Ok(());
        };

        self.apply_result(&execution_id, &handle, &sub_task_id, &msg.payload).await?;
        self.pump(&execution_id, &handle).await
    }

    async fn apply_result(
        &self,
        execution_id: &str,
        handle: &SharedHandle,
        sub_task_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let mut h = handle.lock().await;

        let Some(node_id) = h.context.node_for_sub_task(sub_task_id).await else {
            debug!(sub_task_id, "duplicate or unknown sub-task response, ignoring");
            return Ok(());
        };

        let parts = extract_parts(payload)
            .ok_or_else(|| WorkflowError::Protocol(format!("malformed response payload for sub-task '{sub_task_id}'")))?;
        let Some((status, artifact_name, artifact_version, error_message)) = find_node_result(&parts) else {
            return Err(WorkflowError::Protocol(format!(
                "no workflow_node_result data part for sub-task '{sub_task_id}'"
            )));
        };

        h.context.forget(sub_task_id).await;
        h.sub_task_deadlines.remove(sub_task_id);
        self.sub_task_index.lock().await.remove(sub_task_id);

        match status {
            NodeResultStatus::Success => {
                let output = match (artifact_name, artifact_version) {
                    (Some(name), version) => {
                        let key = ArtifactKey::new(
                            h.workflow_name.clone(),
                            h.context.a2a_context.user_id.clone(),
                            h.context.a2a_context.session_id.clone(),
                            name,
                        );
                        self.artifacts.load(&key, version)?
                    }
                    (None, _) => Value::Null,
                };
                self.on_node_success(execution_id, &mut h, &node_id, output).await
            }
            NodeResultStatus::Failure => {
                let message = error_message.unwrap_or_else(|| "node reported failure with no message".to_string());
                self.on_node_failure(&mut h, &node_id, &message);
                self.emit_progress(
                    &h,
                    execution_id,
                    ProgressKind::NodeExecutionResult,
                    Some(node_id.clone()),
                    serde_json::json!({ "status": "failure", "message": message }),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn on_node_success(
        &self,
        execution_id: &str,
        h: &mut WorkflowHandle,
        node_id: &str,
        output: Value,
    ) -> Result<()> {
        if let Some(fork_id) = find_owning_fork(&h.state, node_id) {
            match fork::on_branch_result(&mut h.state, &fork_id, node_id, output) {
                Ok(true) => {
                    let merged = fork::merged_output(&h.state, &fork_id).unwrap_or(Value::Null);
                    let artifact_name = format!("{fork_id}_output.json");
                    let key = ArtifactKey::new(
                        h.workflow_name.clone(),
                        h.context.a2a_context.user_id.clone(),
                        h.context.a2a_context.session_id.clone(),
                        artifact_name.clone(),
                    );
                    let version = self.artifacts.save(&key, &merged)?;
                    fork::finalize(&mut h.state, &fork_id, merged, artifact_name, version);
                }
                Ok(false) => {}
                Err(_) => debug!(node_id, "duplicate fork branch result ignored"),
            }
            return Ok(());
        }

        if let Some((map_id, index)) = find_owning_map(&h.state, node_id) {
            map::on_result(&mut h.state, &map_id, index, output);
            let progress = map::progress(&h.state, &map_id);
            self.emit_progress(
                h,
                execution_id,
                ProgressKind::MapProgress,
                Some(map_id.clone()),
                serde_json::json!({ "progress": progress }),
            )
            .await;
            if progress.map(|(done, total)| done == total).unwrap_or(true) {
                let results = map::results_array(&h.state, &map_id).unwrap_or_default();
                let artifact_name = format!("{map_id}_output.json");
                let key = ArtifactKey::new(
                    h.workflow_name.clone(),
                    h.context.a2a_context.user_id.clone(),
                    h.context.a2a_context.session_id.clone(),
                    artifact_name.clone(),
                );
                let version = self.artifacts.save(&key, &serde_json::json!({ "results": results }))?;
                map::finalize(&mut h.state, &map_id, artifact_name, version);
            } else {
                self.pump_map_batch(execution_id, h, &map_id).await?;
            }
            return Ok(());
        }

        if let Some(loop_id) = find_owning_loop(&h.state, node_id) {
            let inner_node_id = match h.state.active_branches.get(&loop_id) {
                Some(Tracker::Loop(t)) => t.inner_node_id.clone(),
                _ => return Ok(()),
            };
            loop_node::on_iteration_result(&mut h.state, &loop_id, &inner_node_id, output);
            h.state.pending_nodes.retain(|p| p != &loop_id);
            return Ok(());
        }

        let artifact_name = format!("{node_id}_output.json");
        let key = ArtifactKey::new(
            h.workflow_name.clone(),
            h.context.a2a_context.user_id.clone(),
            h.context.a2a_context.session_id.clone(),
            artifact_name.clone(),
        );
        let version = self.artifacts.save(&key, &output)?;
        h.state.set_output(node_id, output);
        h.state.mark_complete(node_id, Completion::Artifact { name: artifact_name, version });
        self.emit_progress(
            h,
            execution_id,
            ProgressKind::NodeExecutionResult,
            Some(node_id.to_string()),
            serde_json::json!({ "status": "success" }),
        )
        .await;
        Ok(())
    }

    /// A node failed, or was synthesized as failed by a timeout. Per
    /// §4.6 this does not mark the node complete or skip dependents — it
    /// sets `error_state` and the next `pump()` short-circuits straight to
    /// failure finalization.
    fn on_node_failure(&self, h: &mut WorkflowHandle, node_id: &str, message: &str) {
        if h.state.error_state.is_none() {
            h.state.error_state = Some(ErrorState {
                failed_node_id: node_id.to_string(),
                failure_reason: "node_failed".to_string(),
                error_message: message.to_string(),
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Run ready nodes to a fixed point: dispatch every currently-ready
    /// node, let join trackers react, and repeat until nothing is ready.
    /// Returns once the workflow is blocked on in-flight sub-tasks (or has
    /// just finalized).
    async fn pump(&self, execution_id: &str, handle: &SharedHandle) -> Result<()> {
        loop {
            let mut h = handle.lock().await;

            if h.state.error_state.is_some() {
                drop(h);
                return self.finalize_failure(execution_id, handle).await;
            }

            sync_joins(&mut h.state);

            let ready = ready_nodes(&h);
            if ready.is_empty() {
                let finished = all_non_inner_settled(&h);
                drop(h);
                if finished {
                    self.finalize_success(execution_id, handle).await?;
                }
                return Ok(());
            }

            for node_id in ready {
                let Some(node) = h.definition.node(&node_id).cloned() else { continue };
                if let Err(e) = self.dispatch_node(execution_id, handle, &mut h, &node).await {
                    self.on_node_failure(&mut h, &node_id, &e.to_string());
                    break;
                }
            }
        }
    }

    async fn dispatch_node(
        &self,
        execution_id: &str,
        handle: &SharedHandle,
        h: &mut WorkflowHandle,
        node: &WorkflowNode,
    ) -> Result<()> {
        match node {
            WorkflowNode::Agent { id, depends_on, agent_name, input, input_schema_override, output_schema_override, when } => {
                if let Some(condition) = when {
                    if !evaluate_condition(condition, &h.state.node_outputs)? {
                        propagate_skip(&h.dag, &mut h.state, id, SkipReason::ByWhen);
                        return Ok(());
                    }
                }
                let resolved = dispatch::resolve_node_input(
                    id,
                    input.as_ref(),
                    depends_on.as_deref().unwrap_or(&[]),
                    &h.state.node_outputs,
                )?;
                self.dispatch_agent(execution_id, h, id, agent_name, resolved, input_schema_override.as_ref(), output_schema_override.as_ref())
                    .await?;
                Ok(())
            }

            WorkflowNode::Conditional { id, condition, true_branch, false_branch, .. } => {
                conditional::evaluate(&h.dag, &mut h.state, id, condition, true_branch, false_branch.as_deref())
                    .map_err(|e| WorkflowError::Control(e.to_string()))?;
                Ok(())
            }

            WorkflowNode::Switch { id, cases, default, .. } => {
                switch::evaluate(&h.dag, &mut h.state, id, cases, default.as_deref())
                    .map_err(|e| WorkflowError::Control(e.to_string()))?;
                Ok(())
            }

            WorkflowNode::Join { id, wait_for, strategy, n, .. } => {
                join::init(&mut h.state, id, wait_for.clone(), *strategy, *n);
                h.state.mark_pending(id);
                Ok(())
            }

            WorkflowNode::Loop { id, node: inner, condition, max_iterations, delay, .. } => {
                let max = max_iterations.unwrap_or(self.config.default_max_loop_iterations);
                let decision = loop_node::decide(&mut h.state, id, inner, condition, max, delay.is_some())
                    .map_err(|e| WorkflowError::Control(e.to_string()))?;
                match decision {
                    loop_node::LoopDecision::Continue { needs_delay: true } => {
                        h.state.mark_pending(id);
                        let seconds = parse_delay_seconds(delay.as_deref().unwrap())?;
                        let cancellation = h.context.cancellation.clone();
                        let engine = self.clone();
                        let handle_clone = handle.clone();
                        let exec_id = execution_id.to_string();
                        let loop_id = id.clone();
                        let inner_id = inner.clone();
                        tokio::spawn(async move {
                            engine
                                .begin_loop_iteration_delayed(exec_id, handle_clone, loop_id, inner_id, seconds, cancellation)
                                .await;
                        });
                        Ok(())
                    }
                    loop_node::LoopDecision::Continue { needs_delay: false } => {
                        h.state.mark_pending(id);
                        self.begin_loop_iteration(execution_id, h, id, inner).await
                    }
                    stopped => {
                        loop_node::stop(&mut h.state, id, stopped);
                        Ok(())
                    }
                }
            }

            WorkflowNode::Fork { id, branches, .. } => {
                h.state.mark_pending(id);
                let intents = fork::start(&mut h.state, id, branches);
                for intent in intents {
                    let mapping = value_object_to_map(intent.input);
                    let resolved = resolve_map(&mapping, &h.state.node_outputs)?;
                    let resolved_value = Value::Object(resolved.into_iter().collect());
                    let sub_task_id = self
                        .dispatch_agent(execution_id, h, &intent.node_id, &intent.agent_name, resolved_value, None, None)
                        .await?;
                    fork::record_sub_task(&mut h.state, id, &intent.node_id, &sub_task_id);
                }
                Ok(())
            }

            WorkflowNode::Map { id, items, node: inner, concurrency_limit, max_items, .. } => {
                h.state.mark_pending(id);
                let resolved_items_expr = resolve_value(items, &h.state.node_outputs)?;
                let max = max_items.or(Some(self.config.default_max_map_items));
                let resolved_items = map::resolve_items(id, resolved_items_expr, max).map_err(|e| WorkflowError::Control(e.to_string()))?;
                map::init(&mut h.state, id, inner, resolved_items, *concurrency_limit);
                self.pump_map_batch(execution_id, h, id).await
            }
        }
    }

    /// Dispatch a plain agent sub-task with an already-resolved input
    /// value, registering it for correlation and timeout tracking. Returns
    /// the minted sub-task id.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_agent(
        &self,
        execution_id: &str,
        h: &mut WorkflowHandle,
        node_id: &str,
        agent_name: &str,
        resolved_input: Value,
        input_schema_override: Option<&Value>,
        output_schema_override: Option<&Value>,
    ) -> Result<String> {
        let (input_schema, output_schema) = self.registry.effective_schemas(agent_name, input_schema_override, output_schema_override);

        let artifact_key = ArtifactKey::new(
            h.workflow_name.clone(),
            h.context.a2a_context.user_id.clone(),
            h.context.a2a_context.session_id.clone(),
            format!("{node_id}_input.json"),
        );
        let input_part = dispatch::build_input_part(self.artifacts.as_ref(), &artifact_key, &resolved_input, input_schema.as_ref())?;

        let sub_task_id = mint_sub_task_id(execution_id, node_id);
        let request = dispatch::build_request(
            &sub_task_id,
            &h.workflow_name,
            node_id,
            input_schema,
            output_schema,
            input_part,
            &h.context.workflow_task_id,
            &h.context.a2a_context.session_id,
        );

        let properties = UserProperties {
            reply_to: Some(self.topics.response(&h.workflow_name, &sub_task_id)),
            status_topic: Some(self.topics.status(&h.workflow_name, &sub_task_id)),
            user_id: Some(h.context.a2a_context.user_id.clone()),
            client_id: h.context.a2a_context.client_id.clone(),
            user_config: None,
        };

        let payload = serde_json::to_value(&request).map_err(|e| WorkflowError::Protocol(e.to_string()))?;
        self.bus.publish(&self.topics.request(agent_name), payload, properties).await?;

        h.context.register(sub_task_id.clone(), node_id.to_string()).await;
        self.sub_task_index.lock().await.insert(sub_task_id.clone(), execution_id.to_string());
        h.sub_task_deadlines.insert(
            sub_task_id.clone(),
            Instant::now() + Duration::from_secs(self.config.default_node_timeout_seconds),
        );
        h.state.mark_pending(node_id);

        self.emit_progress(
            h,
            execution_id,
            ProgressKind::NodeExecutionStart,
            Some(node_id.to_string()),
            serde_json::json!({ "agent_name": agent_name, "sub_task_id": sub_task_id }),
        )
        .await;

        Ok(sub_task_id)
    }

    /// Dispatch the next batch a map node's capacity allows. A zero-item
    /// map (or a batch that resolves to nothing while results are already
    /// complete) finalizes immediately.
    async fn pump_map_batch(&self, execution_id: &str, h: &mut WorkflowHandle, map_id: &str) -> Result<()> {
        let batch = map::next_batch(&mut h.state, map_id);
        if batch.is_empty() {
            if map::progress(&h.state, map_id) == Some((0, 0)) {
                let artifact_name = format!("{map_id}_output.json");
                let key = ArtifactKey::new(
                    h.workflow_name.clone(),
                    h.context.a2a_context.user_id.clone(),
                    h.context.a2a_context.session_id.clone(),
                    artifact_name.clone(),
                );
                let version = self.artifacts.save(&key, &serde_json::json!({ "results": Vec::<Value>::new() }))?;
                map::finalize(&mut h.state, map_id, artifact_name, version);
            }
            return Ok(());
        }

        let target_node_id = match h.state.active_branches.get(map_id) {
            Some(Tracker::Map(t)) => t.target_node_id.clone(),
            _ => return Ok(()),
        };
        let Some(WorkflowNode::Agent { agent_name, input, input_schema_override, output_schema_override, .. }) =
            h.definition.node(&target_node_id).cloned()
        else {
            return Err(WorkflowError::Protocol(format!("map '{map_id}' inner node '{target_node_id}' must be an agent node")));
        };

        for (index, item) in batch {
            let child_id = format!("{map_id}_item_{index}");
            let mut outputs = h.state.node_outputs.clone();
            outputs.insert("_map_item".to_string(), serde_json::json!({ "output": item }));
            outputs.insert("_map_index".to_string(), serde_json::json!({ "output": index }));
            let resolved = dispatch::resolve_node_input(&child_id, input.as_ref(), &[], &outputs)?;

            let sub_task_id = self
                .dispatch_agent(execution_id, h, &child_id, &agent_name, resolved, input_schema_override.as_ref(), output_schema_override.as_ref())
                .await?;
            map::record_sub_task(&mut h.state, map_id, index, &sub_task_id);
        }
        Ok(())
    }

    /// Mint and dispatch the next loop iteration. Must be called with the
    /// workflow lock already held (not re-entrant against `handle`).
    async fn begin_loop_iteration(&self, execution_id: &str, h: &mut WorkflowHandle, loop_id: &str, inner_node_id: &str) -> Result<()> {
        let (child_id, iteration_index) = loop_node::begin_iteration(&mut h.state, loop_id);
        let Some(WorkflowNode::Agent { agent_name, input, input_schema_override, output_schema_override, depends_on, .. }) =
            h.definition.node(inner_node_id).cloned()
        else {
            return Err(WorkflowError::Protocol(format!("loop '{loop_id}' inner node '{inner_node_id}' must be an agent node")));
        };

        h.state.node_outputs.insert("_loop_iteration".to_string(), serde_json::json!({ "output": iteration_index }));
        let resolved = dispatch::resolve_node_input(&child_id, input.as_ref(), depends_on.as_deref().unwrap_or(&[]), &h.state.node_outputs)?;

        let sub_task_id = self
            .dispatch_agent(execution_id, h, &child_id, &agent_name, resolved, input_schema_override.as_ref(), output_schema_override.as_ref())
            .await?;
        loop_node::record_sub_task(&mut h.state, loop_id, &sub_task_id);
        Ok(())
    }

    /// Background continuation for a delayed loop iteration: sleep (unless
    /// cancelled), then re-acquire the workflow lock and dispatch.
    async fn begin_loop_iteration_delayed(
        &self,
        execution_id: String,
        handle: SharedHandle,
        loop_id: String,
        inner_node_id: String,
        seconds: u64,
        cancellation: CancellationToken,
    ) {
        if !cancellation.sleep_cancellable(Duration::from_secs(seconds)).await {
            return;
        }
        let mut h = handle.lock().await;
        if let Err(e) = self.begin_loop_iteration(&execution_id, &mut h, &loop_id, &inner_node_id).await {
            warn!(error = %e, "loop iteration dispatch failed after delay");
            return;
        }
        drop(h);
        if let Err(e) = self.pump(&execution_id, &handle).await {
            warn!(error = %e, "pump failed after delayed loop dispatch");
        }
    }

    async fn sweep_timeouts(&self) {
        let handles: Vec<(String, SharedHandle)> = {
            self.active_workflows.lock().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (execution_id, handle) in handles {
            let now = Instant::now();
            let (workflow_expired, expired_sub_tasks) = {
                let h = handle.lock().await;
                let expired = h
                    .sub_task_deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>();
                (h.deadline <= now, expired)
            };

            if workflow_expired {
                {
                    let mut h = handle.lock().await;
                    if h.state.error_state.is_none() {
                        h.state.error_state = Some(ErrorState {
                            failed_node_id: String::new(),
                            failure_reason: "workflow_timeout".to_string(),
                            error_message: format!(
                                "workflow exceeded its {}s execution budget",
                                self.config.max_workflow_execution_time_seconds
                            ),
                            timestamp: chrono::Utc::now(),
                        });
                    }
                    h.context.cancellation.cancel();
                }
                if let Err(e) = self.finalize_failure(&execution_id, &handle).await {
                    error!(error = %e, execution_id, "failed to finalize a timed-out workflow");
                }
                continue;
            }

            for sub_task_id in expired_sub_tasks {
                let node_id = {
                    let mut h = handle.lock().await;
                    let node_id = h.context.node_for_sub_task(&sub_task_id).await;
                    h.sub_task_deadlines.remove(&sub_task_id);
                    h.context.forget(&sub_task_id).await;
                    node_id
                };
                self.sub_task_index.lock().await.remove(&sub_task_id);

                let Some(node_id) = node_id else { continue };
                {
                    let mut h = handle.lock().await;
                    self.on_node_failure(&mut h, &node_id, "node timed out waiting for a response");
                }
                if let Err(e) = self.pump(&execution_id, &handle).await {
                    error!(error = %e, execution_id, "pump failed after timeout synthesis");
                }
            }
        }
    }

    async fn finalize_success(&self, execution_id: &str, handle: &SharedHandle) -> Result<()> {
        let mut h = handle.lock().await;
        let resolved = resolve_map(&h.definition.output_mapping, &h.state.node_outputs)?;
        let output = Value::Object(resolved.into_iter().collect());
        let task = TerminalTask::success(&h.context.a2a_context.logical_task_id, &h.context.a2a_context.session_id, &h.workflow_name, output);
        self.publish_terminal(&h, task).await?;
        drop(h);
        self.active_workflows.lock().await.remove(execution_id);
        Ok(())
    }

    async fn finalize_failure(&self, execution_id: &str, handle: &SharedHandle) -> Result<()> {
        let h = handle.lock().await;
        let message = h.state.error_state.as_ref().map(|e| e.error_message.clone()).unwrap_or_else(|| "workflow failed".to_string());
        let task = TerminalTask::failure(&h.context.a2a_context.logical_task_id, &h.context.a2a_context.session_id, &h.workflow_name, &message);
        self.publish_terminal(&h, task).await?;
        drop(h);
        self.active_workflows.lock().await.remove(execution_id);
        Ok(())
    }

    async fn publish_terminal(&self, h: &WorkflowHandle, task: TerminalTask) -> Result<()> {
        let topic = h.context.a2a_context.reply_to_topic.clone().unwrap_or_else(|| {
            let client_id = h.context.a2a_context.client_id.as_deref().unwrap_or(&h.context.a2a_context.user_id);
            self.topics.client_response(client_id)
        });
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": h.context.a2a_context.jsonrpc_request_id.clone(),
            "result": task,
        });
        self.bus.publish(&topic, payload, UserProperties::default()).await?;
        Ok(())
    }

    async fn emit_progress(&self, h: &WorkflowHandle, execution_id: &str, kind: ProgressKind, node_id: Option<String>, data: Value) {
        let event = ProgressEvent::new(chrono::Utc::now(), h.workflow_name.clone(), execution_id, kind, node_id, data);
        if let Some(sink) = &self.progress {
            if let Err(e) = sink.write(&event) {
                warn!(error = %e, "failed to write progress event to the local sink");
            }
        }
        let topic = observer_topic(&self.config.namespace, &h.workflow_name, execution_id);
        let Ok(payload) = serde_json::to_value(&event) else { return };
        if let Err(e) = self.bus.publish(&topic, payload, UserProperties::default()).await {
            debug!(error = %e, "failed to publish progress event to observers");
        }
    }
}

fn mint_execution_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn value_object_to_map(v: Value) -> HashMap<String, Value> {
    match v {
        Value::Object(m) => m.into_iter().collect(),
        _ => HashMap::new(),
    }
}

fn extract_parts(payload: &Value) -> Option<Vec<MessagePart>> {
    let parts = payload.get("result")?.get("status")?.get("message")?.get("parts")?;
    serde_json::from_value(parts.clone()).ok()
}

fn parse_delay_seconds(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    if let Some(stripped) = trimmed.strip_suffix("ms") {
        let ms: u64 = stripped.trim().parse().map_err(|_| WorkflowError::Protocol(format!("invalid delay '{raw}'")))?;
        return Ok(ms.div_ceil(1000));
    }
    let stripped = trimmed.strip_suffix('s').unwrap_or(trimmed);
    stripped.trim().parse::<u64>().map_err(|_| WorkflowError::Protocol(format!("invalid delay '{raw}'")))
}

fn ready_nodes(h: &WorkflowHandle) -> Vec<String> {
    let mut ids: Vec<String> = h
        .dag
        .dependencies
        .keys()
        .filter(|id| !h.dag.is_inner(id))
        .filter(|id| {
            let deps = h.dag.dependencies.get(id.as_str()).cloned().unwrap_or_default();
            h.state.is_ready(id, &deps)
        })
        .cloned()
        .collect();
    ids.sort();
    ids
}

fn all_non_inner_settled(h: &WorkflowHandle) -> bool {
    h.dag
        .dependencies
        .keys()
        .filter(|id| !h.dag.is_inner(id))
        .all(|id| h.state.completed_nodes.contains_key(id))
}

/// Re-check every live join tracker against the current `completed_nodes`
/// set, finalizing any that have become ready. Repeats until a pass makes
/// no further progress, so one join's finalization can unblock a
/// downstream join in the same call.
fn sync_joins(state: &mut ExecutionState) {
    loop {
        let join_ids: Vec<String> = state
            .active_branches
            .iter()
            .filter_map(|(k, v)| matches!(v, Tracker::Join(_)).then(|| k.clone()))
            .collect();
        if join_ids.is_empty() {
            return;
        }

        let mut progressed = false;
        for join_id in join_ids {
            let targets = match state.active_branches.get(&join_id) {
                Some(Tracker::Join(ledger)) => ledger.wait_for.clone(),
                _ => continue,
            };
            let mut ready = false;
            for target in targets {
                if state.completed_nodes.contains_key(&target) {
                    ready = join::on_target_completed(state, &join_id, &target) || ready;
                }
            }
            if ready {
                join::finalize(state, &join_id);
                progressed = true;
            }
        }
        if !progressed {
            return;
        }
    }
}

fn find_owning_fork(state: &ExecutionState, node_id: &str) -> Option<String> {
    state.active_branches.iter().find_map(|(k, v)| match v {
        Tracker::Fork(t) if t.branches.iter().any(|b| b.branch_id == node_id) => Some(k.clone()),
        _ => None,
    })
}

fn find_owning_map(state: &ExecutionState, node_id: &str) -> Option<(String, usize)> {
    state.active_branches.iter().find_map(|(k, v)| match v {
        Tracker::Map(_) => node_id.strip_prefix(&format!("{k}_item_")).and_then(|s| s.parse::<usize>().ok()).map(|idx| (k.clone(), idx)),
        _ => None,
    })
}

fn find_owning_loop(state: &ExecutionState, node_id: &str) -> Option<String> {
    state.active_branches.iter().find_map(|(k, v)| match v {
        Tracker::Loop(_) if node_id.starts_with(&format!("{k}_iter_")) => Some(k.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FsArtifactService;
    use crate::bus::memory::MemoryBus;
    use crate::model::{ForkBranch, JoinStrategy};
    use serde_json::json;
    use tempfile::TempDir;

    fn a2a() -> A2aContext {
        A2aContext {
            logical_task_id: "logical-1".into(),
            session_id: "session-1".into(),
            user_id: "user-1".into(),
            client_id: Some("client-1".into()),
            jsonrpc_request_id: json!(1),
            reply_to_topic: None,
            original_inbound_handle: crate::context::InboundHandle("handle-1".into()),
        }
    }

    fn test_engine(tmp: &TempDir) -> Engine<MemoryBus> {
        let bus = Arc::new(MemoryBus::new());
        let artifacts: Arc<dyn ArtifactService> = Arc::new(FsArtifactService::new(tmp.path()));
        let registry = Arc::new(AgentRegistry::new());
        Engine::new(bus, artifacts, registry, EngineConfig::default(), None)
    }

    fn agent_node(id: &str, depends_on: Option<Vec<&str>>, agent_name: &str) -> WorkflowNode {
        WorkflowNode::Agent {
            id: id.to_string(),
            depends_on: depends_on.map(|v| v.into_iter().map(String::from).collect()),
            agent_name: agent_name.to_string(),
            input: None,
            input_schema_override: None,
            output_schema_override: None,
            when: None,
        }
    }

    fn success_payload(artifact_name: &str, version: u64) -> Value {
        json!({
            "result": {
                "id": "task-1",
                "contextId": "session-1",
                "status": {
                    "state": "completed",
                    "message": {
                        "role": "agent",
                        "parts": [
                            {
                                "kind": "data",
                                "data": {
                                    "type": "workflow_node_result",
                                    "status": "success",
                                    "artifact_name": artifact_name,
                                    "artifact_version": version,
                                },
                            },
                        ],
                    },
                },
            },
        })
    }

    fn failure_payload(message: &str) -> Value {
        json!({
            "result": {
                "id": "task-1",
                "contextId": "session-1",
                "status": {
                    "state": "completed",
                    "message": {
                        "role": "agent",
                        "parts": [
                            {
                                "kind": "data",
                                "data": {
                                    "type": "workflow_node_result",
                                    "status": "failure",
                                    "error_message": message,
                                },
                            },
                        ],
                    },
                },
            },
        })
    }

    fn one_agent_workflow() -> WorkflowDefinition {
        let mut mapping = HashMap::new();
        mapping.insert("result".to_string(), json!("{{step.output}}"));
        WorkflowDefinition {
            description: "single agent step".into(),
            input_schema: None,
            output_schema: None,
            nodes: vec![agent_node("step", None, "writer")],
            output_mapping: mapping,
            skills: None,
        }
    }

    #[tokio::test]
    async fn submit_dispatches_the_first_ready_node() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);
        let execution_id = engine.submit("wf1", one_agent_workflow(), json!({"task": "write"}), a2a()).await.unwrap();

        let sent = engine.bus.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "a2a/agent/request/writer");
        assert!(engine.active_workflows.lock().await.contains_key(&execution_id));
    }

    #[tokio::test]
    async fn success_response_finalizes_and_publishes_terminal_task() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);
        engine.submit("wf1", one_agent_workflow(), json!({"task": "write"}), a2a()).await.unwrap();

        let request_topic = &engine.bus.sent_messages()[0].topic;
        assert_eq!(request_topic, "a2a/agent/request/writer");

        let key = ArtifactKey::new("wf1", "user-1", "session-1", "step_output.json");
        let version = engine.artifacts.save(&key, &json!({"draft": "hello"})).unwrap();

        let response_topic = "a2a/agent/response/wf1/wf_sometoken_step_abcd1234";
        // Correlate manually: the sub-task id minted by submit() is opaque,
        // so re-derive it from the context registered during dispatch.
        let execution_id = engine.active_workflows.lock().await.keys().next().cloned().unwrap();
        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub_task_id = {
            let h = handle.lock().await;
            h.context.sub_task_for_node("step").await.unwrap()
        };
        let _ = response_topic;

        let topic = engine.topics.response("wf1", &sub_task_id);
        engine.handle_inbound(InboundMessage { topic, payload: success_payload("step_output.json", version), properties: UserProperties::default() }).await.unwrap();

        assert!(!engine.active_workflows.lock().await.contains_key(&execution_id));
        let sent = engine.bus.sent_messages();
        let terminal = sent.iter().find(|m| m.topic == "a2a/client/response/client-1").expect("terminal task published");
        assert_eq!(terminal.payload["result"]["status"]["state"], json!("completed"));
        assert_eq!(terminal.payload["result"]["metadata"]["output"]["result"], json!({"draft": "hello"}));
    }

    #[tokio::test]
    async fn failure_response_finalizes_as_failed_without_a_retry() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);
        let execution_id = engine.submit("wf1", one_agent_workflow(), json!({"task": "write"}), a2a()).await.unwrap();

        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub_task_id = {
            let h = handle.lock().await;
            h.context.sub_task_for_node("step").await.unwrap()
        };
        let topic = engine.topics.response("wf1", &sub_task_id);
        engine
            .handle_inbound(InboundMessage { topic, payload: failure_payload("writer exploded"), properties: UserProperties::default() })
            .await
            .unwrap();

        assert!(!engine.active_workflows.lock().await.contains_key(&execution_id));
        let sent = engine.bus.sent_messages();
        let terminal = sent.iter().find(|m| m.topic == "a2a/client/response/client-1").expect("terminal task published");
        assert_eq!(terminal.payload["result"]["status"]["state"], json!("failed"));
    }

    #[tokio::test]
    async fn duplicate_response_after_settlement_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);
        let execution_id = engine.submit("wf1", one_agent_workflow(), json!({"task": "write"}), a2a()).await.unwrap();

        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub_task_id = {
            let h = handle.lock().await;
            h.context.sub_task_for_node("step").await.unwrap()
        };
        let key = ArtifactKey::new("wf1", "user-1", "session-1", "step_output.json");
        let version = engine.artifacts.save(&key, &json!({"draft": "hello"})).unwrap();
        let topic = engine.topics.response("wf1", &sub_task_id);

        engine
            .handle_inbound(InboundMessage { topic: topic.clone(), payload: success_payload("step_output.json", version), properties: UserProperties::default() })
            .await
            .unwrap();
        let sent_before = engine.bus.sent_messages().len();

        // Same topic, same sub-task id: by now it's untracked everywhere.
        engine
            .handle_inbound(InboundMessage { topic, payload: success_payload("step_output.json", version), properties: UserProperties::default() })
            .await
            .unwrap();
        assert_eq!(engine.bus.sent_messages().len(), sent_before);
    }

    #[tokio::test]
    async fn conditional_workflow_skips_the_untaken_branch_and_finalizes() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);

        let def = WorkflowDefinition {
            description: "branch".into(),
            input_schema: None,
            output_schema: None,
            nodes: vec![
                WorkflowNode::Conditional {
                    id: "c".into(),
                    depends_on: None,
                    condition: "{{workflow.input.go}} == true".into(),
                    true_branch: "t".into(),
                    false_branch: Some("f".into()),
                },
                agent_node("t", Some(vec!["c"]), "writer"),
                agent_node("f", Some(vec!["c"]), "writer"),
            ],
            output_mapping: HashMap::new(),
            skills: None,
        };

        let execution_id = engine.submit("wf1", def, json!({"go": true}), a2a()).await.unwrap();
        // Only "t" should have been dispatched.
        assert_eq!(engine.bus.sent_messages().len(), 1);

        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub_task_id = { handle.lock().await.context.sub_task_for_node("t").await.unwrap() };
        let key = ArtifactKey::new("wf1", "user-1", "session-1", "t_output.json");
        let version = engine.artifacts.save(&key, &json!({"ok": true})).unwrap();
        let topic = engine.topics.response("wf1", &sub_task_id);

        engine
            .handle_inbound(InboundMessage { topic, payload: success_payload("t_output.json", version), properties: UserProperties::default() })
            .await
            .unwrap();

        assert!(!engine.active_workflows.lock().await.contains_key(&execution_id));
    }

    #[tokio::test]
    async fn fork_dispatches_every_branch_and_merges_on_completion() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);

        let def = WorkflowDefinition {
            description: "fork".into(),
            input_schema: None,
            output_schema: None,
            nodes: vec![WorkflowNode::Fork {
                id: "f".into(),
                depends_on: None,
                branches: vec![
                    ForkBranch { id: "b1".into(), agent_name: "writer".into(), input: HashMap::new(), output_key: "draft".into() },
                    ForkBranch { id: "b2".into(), agent_name: "critic".into(), input: HashMap::new(), output_key: "review".into() },
                ],
            }],
            output_mapping: HashMap::new(),
            skills: None,
        };

        let execution_id = engine.submit("wf1", def, json!({}), a2a()).await.unwrap();
        assert_eq!(engine.bus.sent_messages().len(), 2);

        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub1 = { handle.lock().await.context.sub_task_for_node("b1").await.unwrap() };
        let sub2 = { handle.lock().await.context.sub_task_for_node("b2").await.unwrap() };

        let key1 = ArtifactKey::new("wf1", "user-1", "session-1", "b1_output.json");
        let v1 = engine.artifacts.save(&key1, &json!({"text": "draft"})).unwrap();
        let key2 = ArtifactKey::new("wf1", "user-1", "session-1", "b2_output.json");
        let v2 = engine.artifacts.save(&key2, &json!({"text": "review"})).unwrap();

        engine
            .handle_inbound(InboundMessage {
                topic: engine.topics.response("wf1", &sub1),
                payload: success_payload("b1_output.json", v1),
                properties: UserProperties::default(),
            })
            .await
            .unwrap();
        assert!(engine.active_workflows.lock().await.contains_key(&execution_id));

        engine
            .handle_inbound(InboundMessage {
                topic: engine.topics.response("wf1", &sub2),
                payload: success_payload("b2_output.json", v2),
                properties: UserProperties::default(),
            })
            .await
            .unwrap();
        assert!(!engine.active_workflows.lock().await.contains_key(&execution_id));
    }

    #[tokio::test]
    async fn join_any_cancels_the_outstanding_target_and_finalizes() {
        let tmp = TempDir::new().unwrap();
        let engine = test_engine(&tmp);

        let def = WorkflowDefinition {
            description: "join any".into(),
            input_schema: None,
            output_schema: None,
            nodes: vec![
                agent_node("a", None, "writer"),
                agent_node("b", None, "critic"),
                WorkflowNode::Join {
                    id: "j".into(),
                    depends_on: Some(vec!["a".into(), "b".into()]),
                    wait_for: vec!["a".into(), "b".into()],
                    strategy: JoinStrategy::Any,
                    n: None,
                },
            ],
            output_mapping: HashMap::new(),
            skills: None,
        };

        let execution_id = engine.submit("wf1", def, json!({}), a2a()).await.unwrap();
        assert_eq!(engine.bus.sent_messages().len(), 2);

        let handle = engine.active_workflows.lock().await.get(&execution_id).unwrap().clone();
        let sub_a = { handle.lock().await.context.sub_task_for_node("a").await.unwrap() };

        let key = ArtifactKey::new("wf1", "user-1", "session-1", "a_output.json");
        let version = engine.artifacts.save(&key, &json!({"first": true})).unwrap();

        engine
            .handle_inbound(InboundMessage {
                topic: engine.topics.response("wf1", &sub_a),
                payload: success_payload("a_output.json", version),
                properties: UserProperties::default(),
            })
            .await
            .unwrap();

        assert!(!engine.active_workflows.lock().await.contains_key(&execution_id));
    }

    #[test]
    fn parse_delay_seconds_accepts_bare_and_suffixed_forms() {
        assert_eq!(parse_delay_seconds("5").unwrap(), 5);
        assert_eq!(parse_delay_seconds("5s").unwrap(), 5);
        assert_eq!(parse_delay_seconds("1500ms").unwrap(), 2);
        assert!(parse_delay_seconds("soon").is_err());
    }
}
