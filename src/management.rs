//! Management layer. One engine per process definition, guarded instance
//! creation, hand-over of forwarded instances, and resumption of paused
//! instances with their called-instance wiring rebuilt.

use anyhow::{anyhow, Result};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::decider::{NextFlowNode, ProcessInfo, TokenInfo};
use crate::engine::{Engine, InstanceEventHandlers, PauseOutcome};
use crate::error::EngineError;
use crate::model::{
    join_process_id, now_millis, split_process_id, subprocess_container_id, ArchivedUserTask,
    DeploymentMethod, FlowNodeKind, InstanceSnapshot, InstanceState, ProcessModel, Token,
    TokenState, UserTaskRecord,
};
use crate::runtime::InstanceSeed;

pub struct Management {
    ctx: Arc<EngineContext>,
    engines: DashMap<String, Arc<Engine>>,
    /// Called instances that must come back PAUSED when crash recovery
    /// restores them, because their caller was interrupted.
    pause_on_restore: DashSet<String>,
}

impl Management {
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Management> {
        Arc::new(Management {
            ctx,
            engines: DashMap::new(),
            pause_on_restore: DashSet::new(),
        })
    }

    pub fn ctx(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Engine for a definition, created on first use.
    pub fn ensure_process_engine(self: &Arc<Self>, definition_id: &str) -> Arc<Engine> {
        if let Some(engine) = self.engines.get(definition_id) {
            return engine.value().clone();
        }
        let engine = Engine::new(definition_id, self.ctx.clone(), Arc::downgrade(self));
        self.engines
            .entry(definition_id.to_string())
            .or_insert(engine)
            .value()
            .clone()
    }

    pub async fn ensure_process_engine_with_version(
        self: &Arc<Self>,
        definition_id: &str,
        version: u64,
    ) -> Result<Arc<Engine>> {
        let engine = self.ensure_process_engine(definition_id);
        engine.deploy_process_version(version).await?;
        Ok(engine)
    }

    pub fn get_engine_with_definition_id(&self, definition_id: &str) -> Option<Arc<Engine>> {
        self.engines.get(definition_id).map(|e| e.value().clone())
    }

    /// Engine currently executing the given instance.
    pub fn get_engine_with_id(&self, instance_id: &str) -> Result<Arc<Engine>, EngineError> {
        for entry in self.engines.iter() {
            if entry.value().has_instance(instance_id) {
                return Ok(entry.value().clone());
            }
        }
        Err(EngineError::UnknownInstance(instance_id.to_string()))
    }

    pub async fn remove_process_engine(&self, definition_id: &str) {
        if let Some((_, engine)) = self.engines.remove(definition_id) {
            engine.destroy().await;
        }
    }

    // --- instance creation ---

    /// Creates an instance locally, unless this machine refuses it: process
    /// execution may be deactivated, or a dynamically deployed process may
    /// rule this machine out for its first flow node. `None` means refused,
    /// not failed.
    pub async fn create_instance(
        self: &Arc<Self>,
        definition_id: &str,
        version: u64,
        variables: HashMap<String, Value>,
        activity_id: Option<String>,
        handlers: InstanceEventHandlers,
        calling_instance: Option<String>,
    ) -> Result<Option<String>> {
        if self.ctx.config.processes.deactivate_process_execution {
            info!(definition_id, "process execution is deactivated, refusing the instance");
            return Ok(None);
        }
        if !self
            .allowed_to_start_locally(definition_id, version, activity_id.as_deref())
            .await?
        {
            warn!(
                definition_id,
                version, "this machine does not satisfy the start constraints"
            );
            return Ok(None);
        }
        let engine = self.ensure_process_engine(definition_id);
        let instance_id = match (activity_id, calling_instance) {
            (None, None) => {
                engine
                    .start_process_version(version, variables, handlers)
                    .await?
            }
            (Some(activity), None) => {
                engine
                    .start_process_version_at(version, &activity, variables, handlers)
                    .await?
            }
            (None, Some(caller)) => {
                engine
                    .start_called_process(version, variables, handlers, caller)
                    .await?
            }
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "called instances cannot start at an arbitrary activity"
                ));
            }
        };
        Ok(Some(instance_id))
    }

    async fn allowed_to_start_locally(
        &self,
        definition_id: &str,
        version: u64,
        activity_id: Option<&str>,
    ) -> Result<bool> {
        let Some(model) = self.stored_model(definition_id, version).await? else {
            // Missing versions fail later in the engine with a proper error.
            return Ok(true);
        };
        if model.deployment_method != Some(DeploymentMethod::Dynamic) {
            return Ok(true);
        }
        let start = match activity_id {
            Some(id) => model.node(id),
            None => model.start_node(),
        };
        let Some(start) = start else {
            return Ok(true);
        };
        let process_info = ProcessInfo {
            id: join_process_id(definition_id, version),
            next_flow_node: NextFlowNode {
                id: start.id.clone(),
                is_user_task: start.is_user_task(),
            },
        };
        let token_info = TokenInfo {
            global_start_time: now_millis(),
            local_start_time: Some(now_millis()),
            ..Default::default()
        };
        self.ctx
            .decider
            .allowed_to_execute_locally(
                &process_info,
                &token_info,
                &start.constraints,
                &model.constraints,
            )
            .await
    }

    async fn stored_model(
        &self,
        definition_id: &str,
        version: u64,
    ) -> Result<Option<ProcessModel>> {
        let Some(text) = self
            .ctx
            .storage
            .get_process_version(definition_id, version)
            .await?
        else {
            return Ok(None);
        };
        Ok(ProcessModel::parse(&text).ok())
    }

    // --- forwarded instances ---

    /// Takes in an instance forwarded by another machine. The carried token
    /// re-enters at its target flow node. Returns `None` when this machine
    /// refuses the token.
    pub async fn continue_instance(
        self: &Arc<Self>,
        definition_id: &str,
        payload: InstanceSnapshot,
    ) -> Result<Option<String>> {
        let token = payload
            .tokens
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("forwarded instance carries no token"))?;
        let to = token
            .to
            .clone()
            .ok_or_else(|| anyhow!("forwarded token has no target flow node"))?;
        if self.ctx.config.processes.deactivate_process_execution {
            return Ok(None);
        }
        let (_, version) = split_process_id(&payload.process_id)
            .ok_or_else(|| anyhow!("malformed process id {}", payload.process_id))?;
        if !self
            .allowed_to_continue_locally(definition_id, version, &to, &token, &payload)
            .await?
        {
            warn!(
                definition_id,
                instance_id = %payload.process_instance_id,
                "this machine does not satisfy the constraints of the incoming token"
            );
            return Ok(None);
        }
        let engine = self
            .ensure_process_engine_with_version(definition_id, version)
            .await?;
        if let Ok(instance) = engine.live_instance(&payload.process_instance_id) {
            engine
                .insert_incoming_instance_data(&instance, &payload)
                .await?;
            return Ok(Some(payload.process_instance_id.clone()));
        }

        let mut token = token;
        token.machine_hops += 1;
        token.state = TokenState::Ready;
        token.next_machine = None;
        token.end_time = None;
        token.decider_storage_rounds = 0;
        token.decider_storage_time = 0;
        token.local_start_time = Some(now_millis());
        token.local_execution_time = 0;
        token.previous_flow_element_id = token.from.take();
        token.current_flow_element_id = Some(to.clone());
        token.current_flow_element_start_time = None;
        token.to = None;
        let seed = InstanceSeed {
            instance_id: payload.process_instance_id.clone(),
            global_start_time: Some(payload.global_start_time),
            tokens: vec![token],
            variables: payload.variables.clone(),
            log: payload.log.clone(),
            adaptation_log: payload.adaptation_log.clone(),
            calling_instance: payload.calling_instance.clone(),
            pausing: false,
        };
        let instance_id = engine
            .start_process_version_with_state(version, seed, InstanceEventHandlers::default())
            .await?;
        info!(
            definition_id,
            instance_id = %instance_id, "forwarded instance continues here"
        );
        Ok(Some(instance_id))
    }

    async fn allowed_to_continue_locally(
        &self,
        definition_id: &str,
        version: u64,
        to: &str,
        token: &Token,
        payload: &InstanceSnapshot,
    ) -> Result<bool> {
        let Some(model) = self.stored_model(definition_id, version).await? else {
            return Ok(true);
        };
        if model.deployment_method != Some(DeploymentMethod::Dynamic) {
            return Ok(true);
        }
        let Some(node) = model.node(to) else {
            return Ok(true);
        };
        let process_info = ProcessInfo {
            id: payload.process_id.clone(),
            next_flow_node: NextFlowNode {
                id: node.id.clone(),
                is_user_task: node.is_user_task(),
            },
        };
        let token_info = TokenInfo {
            global_start_time: payload.global_start_time,
            local_start_time: Some(now_millis()),
            local_execution_time: 0,
            machine_hops: token.machine_hops + 1,
            decider_storage_rounds: 0,
            decider_storage_time: 0,
            flow_element_elapsed_ms: None,
        };
        self.ctx
            .decider
            .allowed_to_execute_locally(
                &process_info,
                &token_info,
                &node.constraints,
                &model.constraints,
            )
            .await
    }

    // --- resuming paused instances ---

    /// Brings a paused archived instance back to life under its original id.
    /// Paused tokens re-enter their nodes; paused called instances resume
    /// with their caller-completion wiring rebuilt.
    pub async fn resume_instance(
        self: &Arc<Self>,
        definition_id: &str,
        instance_id: &str,
    ) -> Result<String> {
        let archive = self
            .ctx
            .storage
            .get_archived_instance(definition_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        match archive.info.instance_state.first() {
            Some(InstanceState::Paused) | Some(InstanceState::Pausing) => {}
            other => {
                return Err(anyhow!(
                    "instance {instance_id} is not paused (state {other:?})"
                ));
            }
        }
        let (_, version) = split_process_id(&archive.info.process_id)
            .ok_or_else(|| anyhow!("malformed process id {}", archive.info.process_id))?;
        let engine = self
            .ensure_process_engine_with_version(definition_id, version)
            .await?;
        if engine.has_instance(instance_id) {
            return Ok(instance_id.to_string());
        }
        let model = engine
            .deployed_version(version)
            .ok_or_else(|| anyhow!("version {version} vanished after deployment"))?
            .model();

        let archived_tokens = archive.info.tokens.clone();
        let mut tokens = archive.info.tokens.clone();
        let mut called = Vec::new();
        for token in &mut tokens {
            if token.state.is_terminal() || token.state == TokenState::DeploymentWaiting {
                continue;
            }
            let node = model.node(token.current_node());
            match node.map(|n| &n.kind) {
                Some(FlowNodeKind::SubProcess)
                    if has_live_children(&archived_tokens, &token.token_id) =>
                {
                    // The container keeps waiting; its children carry the
                    // actual work.
                    token.state = TokenState::Running;
                }
                Some(FlowNodeKind::CallActivity) if token.called_instance.is_some() => {
                    token.state = TokenState::Running;
                    if let Some(import) = model.import_for(token.current_node()) {
                        called.push((
                            import.definition_id.clone(),
                            token.called_instance.clone().unwrap_or_default(),
                        ));
                    }
                }
                _ => {
                    token.state = TokenState::Ready;
                    token.current_flow_element_start_time = None;
                    token.end_time = None;
                }
            }
        }

        let handlers = self.caller_completion_handlers(archive.info.calling_instance.as_deref());
        let seed = InstanceSeed {
            instance_id: instance_id.to_string(),
            global_start_time: Some(archive.info.global_start_time),
            tokens,
            variables: archive.info.variables.clone(),
            log: archive.info.log.clone(),
            adaptation_log: archive.info.adaptation_log.clone(),
            calling_instance: archive.info.calling_instance.clone(),
            pausing: false,
        };
        let resumed = engine
            .start_process_version_with_state(version, seed, handlers)
            .await?;
        info!(definition_id, instance_id = %resumed, "instance resumed");

        for (child_definition, child_id) in called {
            if child_id.is_empty() {
                continue;
            }
            if let Err(error) =
                Box::pin(self.resume_instance(&child_definition, &child_id)).await
            {
                warn!(
                    instance_id = %resumed,
                    called_instance = %child_id,
                    error = %error,
                    "called instance did not resume"
                );
            }
        }
        Ok(resumed)
    }

    /// Handlers completing the caller's call activity token when a revived
    /// called instance ends.
    pub(crate) fn caller_completion_handlers(
        self: &Arc<Self>,
        calling_instance: Option<&str>,
    ) -> InstanceEventHandlers {
        let Some(caller_id) = calling_instance else {
            return InstanceEventHandlers::default();
        };
        let caller_id = caller_id.to_string();
        let management = Arc::downgrade(self);
        InstanceEventHandlers {
            on_ended: Some(Box::new(move |snapshot| {
                let Some(management) = management.upgrade() else {
                    return;
                };
                let caller_id = caller_id.clone();
                let child_id = snapshot.process_instance_id.clone();
                let variables = snapshot.variable_values();
                tokio::spawn(async move {
                    if let Err(error) = management
                        .complete_call_activity(&caller_id, &child_id, variables)
                        .await
                    {
                        warn!(
                            instance_id = %caller_id,
                            called_instance = %child_id,
                            error = %error,
                            "caller did not take the called instance result"
                        );
                    }
                });
            })),
            ..Default::default()
        }
    }

    /// Feeds a finished called instance's variables into the caller's
    /// waiting call activity token.
    pub(crate) async fn complete_call_activity(
        &self,
        caller_id: &str,
        child_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        let engine = self.get_engine_with_id(caller_id)?;
        let instance = engine.live_instance(caller_id)?;
        let token = instance
            .tokens()
            .await
            .into_iter()
            .find(|t| t.called_instance.as_deref() == Some(child_id))
            .ok_or_else(|| {
                anyhow!("instance {caller_id} has no token waiting on {child_id}")
            })?;
        let activity = token.current_node().to_string();
        instance.complete_activity(&token.token_id, Some(variables), Some(activity))
    }

    // --- instance operations by id ---

    pub async fn stop_instance_by_id(&self, instance_id: &str) -> Result<()> {
        self.get_engine_with_id(instance_id)?
            .stop_instance(instance_id)
            .await
    }

    pub async fn abort_instance_by_id(&self, instance_id: &str) -> Result<()> {
        self.get_engine_with_id(instance_id)?
            .abort_instance(instance_id)
            .await
    }

    pub async fn pause_instance_by_id(&self, instance_id: &str) -> Result<PauseOutcome> {
        self.get_engine_with_id(instance_id)?
            .pause_instance(instance_id)
            .await
    }

    // --- user task aggregation ---

    pub async fn get_pending_user_tasks(&self) -> Vec<UserTaskRecord> {
        let mut all = Vec::new();
        for entry in self.engines.iter() {
            all.extend(entry.value().pending_user_tasks().await);
        }
        all
    }

    /// Closed user tasks from the archives of every known definition.
    pub async fn get_inactive_user_tasks(&self) -> Result<Vec<ArchivedUserTask>> {
        let mut all = Vec::new();
        for definition_id in self.ctx.storage.get_all_processes().await? {
            for (_, archive) in self.ctx.storage.get_archived_instances(&definition_id).await? {
                all.extend(
                    archive
                        .user_tasks
                        .into_iter()
                        .filter(|t| !t.state.is_open()),
                );
            }
        }
        Ok(all)
    }

    // --- crash recovery support ---

    pub(crate) fn mark_pause_on_restore(&self, instance_id: &str) {
        self.pause_on_restore.insert(instance_id.to_string());
    }

    pub(crate) fn take_pause_on_restore(&self, instance_id: &str) -> bool {
        self.pause_on_restore.remove(instance_id).is_some()
    }
}

pub(crate) fn has_live_children(tokens: &[Token], container_token_id: &str) -> bool {
    tokens.iter().any(|t| {
        subprocess_container_id(&t.token_id) == Some(container_token_id)
            && !t.state.is_terminal()
    })
}
