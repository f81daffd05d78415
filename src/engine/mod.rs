//! Per-definition process engine. Deploys versions, starts and revives
//! instances, runs their lifecycle operations and keeps the archive current.

mod dispatch;
mod user_tasks;

pub use dispatch::{EndedHandler, InstanceEventHandlers, StartedHandler, TokenEndedHandler};
pub use user_tasks::UserTaskUpdate;

use anyhow::{anyhow, Result};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::management::Management;
use crate::model::{
    join_process_id, now_millis, split_process_id, subprocess_container_id, AdaptationEntry,
    ArchivedInstance, ArchivedUserTask, ExecutionState, FlowNodeKind, InstanceSnapshot,
    InstanceState, Machine, ProcessModel, Token, TokenState, UserTaskRecord, UserTaskState,
};
use crate::network::Forwarder;
use crate::runtime::{
    DeployedProcess, ExecutionHooks, Instance, InstanceSeed, StartPosition, TokenMove,
};
use dispatch::HookDispatch;

/// How a pause request resolved: either the instance froze, or it ran to its
/// natural end before all tokens could be paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    Ended,
}

/// Token relocations requested by a migration, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMapping {
    pub token_id: String,
    pub current_flow_element_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationArgs {
    #[serde(default)]
    pub token_mapping: Vec<TokenMapping>,
}

/// Instance status as served to operators: the live snapshot while the
/// instance runs here, the archived record afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInformation {
    pub definition_id: String,
    pub process_version: u64,
    #[serde(flatten)]
    pub archive: ArchivedInstance,
}

/// Executes all deployed versions of one process definition.
pub struct Engine {
    definition_id: String,
    ctx: Arc<EngineContext>,
    management: Weak<Management>,
    machine: OnceLock<Machine>,
    versions: DashMap<u64, Arc<DeployedProcess>>,
    instance_ids: DashSet<String>,
    user_tasks: RwLock<Vec<UserTaskRecord>>,
    instance_handlers: DashMap<String, Arc<InstanceEventHandlers>>,
    forwarder: Forwarder,
    dispatch: Arc<HookDispatch>,
}

impl Engine {
    pub fn new(
        definition_id: &str,
        ctx: Arc<EngineContext>,
        management: Weak<Management>,
    ) -> Arc<Engine> {
        Arc::new_cyclic(|weak: &Weak<Engine>| Engine {
            definition_id: definition_id.to_string(),
            forwarder: Forwarder::new(ctx.network.clone(), ctx.storage.clone()),
            ctx,
            management,
            machine: OnceLock::new(),
            versions: DashMap::new(),
            instance_ids: DashSet::new(),
            user_tasks: RwLock::new(Vec::new()),
            instance_handlers: DashMap::new(),
            dispatch: Arc::new(HookDispatch::new(weak.clone())),
        })
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn ctx(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub(crate) fn management(&self) -> Option<Arc<Management>> {
        self.management.upgrade()
    }

    pub(crate) fn handlers(&self, instance_id: &str) -> Option<Arc<InstanceEventHandlers>> {
        self.instance_handlers
            .get(instance_id)
            .map(|e| e.value().clone())
    }

    /// This machine's identity, resolved once through discovery.
    pub async fn machine_information(&self) -> Machine {
        if let Some(machine) = self.machine.get() {
            return machine.clone();
        }
        let machine = self.ctx.discovery.self_machine().await;
        let _ = self.machine.set(machine.clone());
        self.machine.get().cloned().unwrap_or(machine)
    }

    // --- deployment ---

    /// Loads a stored version into the engine. Idempotent; deploying the same
    /// version twice is a no-op.
    pub async fn deploy_process_version(&self, version: u64) -> Result<Arc<DeployedProcess>> {
        if let Some(deployed) = self.versions.get(&version) {
            return Ok(deployed.value().clone());
        }
        let text = self
            .ctx
            .storage
            .get_process_version(&self.definition_id, version)
            .await?
            .ok_or_else(|| EngineError::UnknownProcessVersion {
                definition_id: self.definition_id.clone(),
                version,
            })?;
        let model = ProcessModel::parse(&text).map_err(|e| EngineError::InvalidProcessVersion {
            definition_id: self.definition_id.clone(),
            version,
            reason: e.to_string(),
        })?;
        if !self
            .ctx
            .storage
            .is_process_version_valid(&self.definition_id, version)
            .await?
        {
            return Err(EngineError::InvalidProcessVersion {
                definition_id: self.definition_id.clone(),
                version,
                reason: "missing user task files or imported process versions".to_string(),
            }
            .into());
        }
        let machine = self.machine_information().await.summary();
        let deployed = Arc::new(DeployedProcess::new(
            &self.definition_id,
            version,
            Arc::new(model),
            machine,
            self.dispatch.clone() as Arc<dyn ExecutionHooks>,
        ));
        info!(
            definition_id = %self.definition_id,
            version, "process version deployed"
        );
        self.versions.insert(version, deployed.clone());
        Ok(deployed)
    }

    pub fn deployed_version(&self, version: u64) -> Option<Arc<DeployedProcess>> {
        self.versions.get(&version).map(|e| e.value().clone())
    }

    pub fn deployed_versions(&self) -> Vec<u64> {
        self.versions.iter().map(|e| *e.key()).collect()
    }

    // --- starting instances ---

    /// Starts an instance at the process start event.
    pub async fn start_process_version(
        &self,
        version: u64,
        variables: HashMap<String, Value>,
        handlers: InstanceEventHandlers,
    ) -> Result<String> {
        self.start_on(version, variables, StartPosition::Default, None, handlers)
            .await
    }

    /// Starts an instance with its token directly at `activity_id`.
    pub async fn start_process_version_at(
        &self,
        version: u64,
        activity_id: &str,
        variables: HashMap<String, Value>,
        handlers: InstanceEventHandlers,
    ) -> Result<String> {
        self.start_on(
            version,
            variables,
            StartPosition::AtActivity(activity_id.to_string()),
            None,
            handlers,
        )
        .await
    }

    /// Start on behalf of a call activity in `calling_instance`.
    pub(crate) async fn start_called_process(
        &self,
        version: u64,
        variables: HashMap<String, Value>,
        handlers: InstanceEventHandlers,
        calling_instance: String,
    ) -> Result<String> {
        self.start_on(
            version,
            variables,
            StartPosition::Default,
            Some(calling_instance),
            handlers,
        )
        .await
    }

    async fn start_on(
        &self,
        version: u64,
        variables: HashMap<String, Value>,
        position: StartPosition,
        calling_instance: Option<String>,
        handlers: InstanceEventHandlers,
    ) -> Result<String> {
        let process = self.deploy_process_version(version).await?;
        let instance_id = Uuid::new_v4().to_string();
        self.instance_handlers
            .insert(instance_id.clone(), Arc::new(handlers));
        match process
            .start_instance(instance_id.clone(), variables, position, calling_instance)
            .await
        {
            Ok(instance) => Ok(instance.id().to_string()),
            Err(error) => {
                self.instance_handlers.remove(&instance_id);
                Err(error)
            }
        }
    }

    /// Revives an instance from imported or archived state, keeping its id.
    pub async fn start_process_version_with_state(
        &self,
        version: u64,
        seed: InstanceSeed,
        handlers: InstanceEventHandlers,
    ) -> Result<String> {
        let process = self.deploy_process_version(version).await?;
        let instance_id = seed.instance_id.clone();
        self.instance_handlers
            .insert(instance_id.clone(), Arc::new(handlers));
        match process.start_with_state(seed).await {
            Ok(instance) => Ok(instance.id().to_string()),
            Err(error) => {
                self.instance_handlers.remove(&instance_id);
                Err(error)
            }
        }
    }

    pub(crate) fn attach_instance(&self, instance: &Arc<Instance>) {
        self.instance_ids.insert(instance.id().to_string());
    }

    pub fn has_instance(&self, instance_id: &str) -> bool {
        self.instance_ids.contains(instance_id)
    }

    pub fn live_instance(&self, instance_id: &str) -> Result<Arc<Instance>, EngineError> {
        for entry in self.versions.iter() {
            if let Some(instance) = entry.value().get_instance(instance_id) {
                return Ok(instance);
            }
        }
        Err(EngineError::UnknownInstance(instance_id.to_string()))
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.versions
            .iter()
            .flat_map(|e| e.value().instances())
            .collect()
    }

    // --- incoming tokens ---

    /// Folds a forwarded snapshot into an instance already running here. The
    /// carried token re-enters at its target node.
    pub async fn insert_incoming_instance_data(
        &self,
        instance: &Arc<Instance>,
        payload: &InstanceSnapshot,
    ) -> Result<()> {
        let mut token = payload
            .tokens
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("forwarded instance carries no token"))?;
        let to = token
            .to
            .clone()
            .ok_or_else(|| anyhow!("forwarded token has no target flow node"))?;
        instance.merge_incoming(payload).await;
        token.machine_hops += 1;
        token.next_machine = None;
        token.decider_storage_rounds = 0;
        token.decider_storage_time = 0;
        token.local_start_time = Some(now_millis());
        token.local_execution_time = 0;
        instance.place_token_at(token, &to).await;
        Ok(())
    }

    // --- lifecycle operations ---

    /// Stops a live instance: every interruptible token ends STOPPED.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        self.teardown_instance(
            instance_id,
            TokenState::Stopped,
            ExecutionState::Stopped,
            None,
        )
        .await
    }

    /// Stop over violated execution constraints, with the violation message
    /// on every ended token.
    pub async fn stop_unfulfilled_instance(
        &self,
        instance_id: &str,
        message: Option<String>,
    ) -> Result<()> {
        self.teardown_instance(
            instance_id,
            TokenState::ErrorConstraintUnfulfilled,
            ExecutionState::ErrorConstraintUnfulfilled,
            message,
        )
        .await
    }

    /// Aborts a live instance and tells every known machine, so distributed
    /// parts of it abort too.
    pub async fn abort_instance(&self, instance_id: &str) -> Result<()> {
        self.teardown_instance(
            instance_id,
            TokenState::Aborted,
            ExecutionState::Aborted,
            None,
        )
        .await?;
        let machines = self.ctx.discovery.online_machines().await;
        self.forwarder
            .broadcast_instance_state(&machines, &self.definition_id, instance_id, "aborted")
            .await;
        Ok(())
    }

    async fn teardown_instance(
        &self,
        instance_id: &str,
        token_state: TokenState,
        log_state: ExecutionState,
        message: Option<String>,
    ) -> Result<()> {
        let instance = self.live_instance(instance_id)?;
        instance.mark_external_teardown().await;
        for token in instance.tokens().await {
            if !token.state.is_interruptible() {
                continue;
            }
            instance
                .log_execution(
                    token.current_node(),
                    &token.token_id,
                    log_state,
                    message.clone(),
                )
                .await;
            instance
                .end_token(&token.token_id, Some(token_state), message.clone())
                .await?;
        }
        instance.halt().await;
        info!(
            definition_id = %self.definition_id,
            instance_id, state = %token_state, "instance torn down"
        );
        let snapshot = instance.snapshot().await;
        self.ctx
            .publisher
            .publish_instance_state(&self.definition_id, &snapshot)
            .await;
        self.archive(&instance, false).await?;
        self.delete_instance(instance_id).await;
        Ok(())
    }

    /// Pauses a live instance. Waits until every token settled into PAUSED
    /// or a terminal state; an instance that completes while pausing wins.
    pub async fn pause_instance(&self, instance_id: &str) -> Result<PauseOutcome> {
        let instance = self.live_instance(instance_id)?;
        let mut changes = instance.subscribe();
        instance.set_pausing().await;
        loop {
            let tokens = instance.tokens().await;
            if tokens.iter().all(|t| t.state.is_terminal()) {
                // Ran to its end before the pause could take hold; the
                // natural completion already archived and dropped it.
                return Ok(PauseOutcome::Ended);
            }
            let model = instance.model().await;
            for token in &tokens {
                let pausable = match token.state {
                    TokenState::Ready | TokenState::DeploymentWaiting => true,
                    TokenState::Running => {
                        match model.node(token.current_node()).map(|n| &n.kind) {
                            Some(FlowNodeKind::UserTask { .. }) => true,
                            Some(FlowNodeKind::CallActivity) => token.called_instance.is_some(),
                            Some(FlowNodeKind::SubProcess) => {
                                // Containers pause after their children.
                                !tokens.iter().any(|t| {
                                    subprocess_container_id(&t.token_id)
                                        == Some(token.token_id.as_str())
                                        && !t.state.is_terminal()
                                        && t.state != TokenState::Paused
                                })
                            }
                            _ => false,
                        }
                    }
                    _ => false,
                };
                if pausable {
                    instance.pause_token(&token.token_id).await?;
                }
            }
            let settled = instance
                .tokens()
                .await
                .iter()
                .all(|t| t.state == TokenState::Paused || t.state.is_terminal());
            if settled {
                break;
            }
            // Running activities drain on their own; wake up on any change.
            if changes.changed().await.is_err() {
                break;
            }
        }
        instance.finalize_pause().await;
        info!(
            definition_id = %self.definition_id,
            instance_id, "instance paused"
        );
        let snapshot = instance.snapshot().await;
        self.ctx
            .publisher
            .publish_instance_state(&self.definition_id, &snapshot)
            .await;
        self.archive(&instance, false).await?;
        self.delete_instance(instance_id).await;
        Ok(PauseOutcome::Paused)
    }

    // --- migration ---

    /// Moves live instances from `source_version` to `target_version`,
    /// relocating tokens per the mapping and re-entering READY ones.
    pub async fn migrate(
        &self,
        source_version: u64,
        target_version: u64,
        instance_ids: &[String],
        args: &MigrationArgs,
    ) -> Result<()> {
        let target = self.deploy_process_version(target_version).await?;
        let moves: Vec<TokenMove> = args
            .token_mapping
            .iter()
            .map(|m| TokenMove {
                token_id: m.token_id.clone(),
                target_flow_element_id: m.current_flow_element_id.clone(),
            })
            .collect();
        for instance_id in instance_ids {
            let instance = self.live_instance(instance_id)?;
            let current = instance.version().await;
            if current != source_version {
                return Err(anyhow!(
                    "instance {instance_id} runs version {current}, not {source_version}"
                ));
            }
            // Parked user tasks are re-registered when their tokens re-enter.
            {
                let mut tasks = self.user_tasks.write().await;
                tasks.retain(|r| {
                    !(r.instance_id == *instance_id && r.state == UserTaskState::Ready)
                });
            }
            instance
                .apply_migration(
                    join_process_id(&self.definition_id, target_version),
                    target_version,
                    target.model(),
                    &moves,
                )
                .await?;
            if let Some(source) = self.versions.get(&source_version) {
                source.value().remove_instance(instance_id);
            }
            target.adopt(instance.clone());
            instance
                .append_adaptation(AdaptationEntry::Migration {
                    time: now_millis(),
                    source_version,
                    target_version,
                })
                .await;
            info!(
                definition_id = %self.definition_id,
                instance_id, source_version, target_version, "instance migrated"
            );
        }
        Ok(())
    }

    // --- status ---

    pub async fn get_instance_information(
        &self,
        instance_id: &str,
    ) -> Result<InstanceInformation> {
        if let Ok(instance) = self.live_instance(instance_id) {
            let info = instance.snapshot().await;
            let version = instance.version().await;
            let tasks = self.user_tasks.read().await;
            let user_tasks = tasks
                .iter()
                .filter(|r| r.instance_id == instance_id)
                .map(ArchivedUserTask::from_record)
                .collect();
            return Ok(InstanceInformation {
                definition_id: self.definition_id.clone(),
                process_version: version,
                archive: ArchivedInstance {
                    info,
                    is_currently_executed_in_bpmn_engine: true,
                    user_tasks,
                },
            });
        }
        let archive = self
            .ctx
            .storage
            .get_archived_instance(&self.definition_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        let (_, version) = split_process_id(&archive.info.process_id)
            .ok_or_else(|| anyhow!("archived process id {} is malformed", archive.info.process_id))?;
        Ok(InstanceInformation {
            definition_id: self.definition_id.clone(),
            process_version: version,
            archive,
        })
    }

    pub async fn get_instance_state(&self, instance_id: &str) -> Result<Vec<InstanceState>> {
        if let Ok(instance) = self.live_instance(instance_id) {
            return Ok(instance.instance_state().await);
        }
        let archive = self
            .ctx
            .storage
            .get_archived_instance(&self.definition_id, instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        Ok(archive.info.instance_state)
    }

    pub async fn pending_user_tasks(&self) -> Vec<UserTaskRecord> {
        self.user_tasks
            .read()
            .await
            .iter()
            .filter(|r| r.state.is_open())
            .cloned()
            .collect()
    }

    // --- archive plumbing ---

    pub(crate) async fn save_intermediate(&self, instance: &Arc<Instance>) -> Result<()> {
        self.archive(instance, true).await
    }

    async fn archive(&self, instance: &Arc<Instance>, live: bool) -> Result<()> {
        let info = instance.snapshot().await;
        let user_tasks = {
            let tasks = self.user_tasks.read().await;
            tasks
                .iter()
                .filter(|r| r.instance_id == instance.id())
                .map(ArchivedUserTask::from_record)
                .collect()
        };
        let archive = ArchivedInstance {
            info,
            is_currently_executed_in_bpmn_engine: live,
            user_tasks,
        };
        self.ctx
            .storage
            .archive_instance(&self.definition_id, instance.id(), &archive)
            .await
    }

    /// Natural end of an instance: publish, archive, notify, drop.
    pub(crate) async fn finalize_instance(&self, instance: &Arc<Instance>) {
        let snapshot = instance.snapshot().await;
        info!(
            definition_id = %self.definition_id,
            instance_id = %instance.id(), "instance ended"
        );
        self.ctx
            .publisher
            .publish_instance_state(&self.definition_id, &snapshot)
            .await;
        if let Err(e) = self.archive(instance, false).await {
            error!(
                instance_id = %instance.id(),
                error = %e, "archiving ended instance failed"
            );
        }
        if let Some(handlers) = self.handlers(instance.id()) {
            if let Some(on_ended) = &handlers.on_ended {
                on_ended(&snapshot);
            }
        }
        self.delete_instance(instance.id()).await;
    }

    pub(crate) async fn delete_instance(&self, instance_id: &str) {
        let mut held = None;
        for entry in self.versions.iter() {
            if let Some(instance) = entry.value().remove_instance(instance_id) {
                held = Some(instance);
            }
        }
        self.instance_ids.remove(instance_id);
        self.instance_handlers.remove(instance_id);
        {
            let mut tasks = self.user_tasks.write().await;
            tasks.retain(|r| r.instance_id != instance_id);
        }
        self.ctx.publisher.teardown(instance_id);
        if let Some(instance) = held {
            instance.halt().await;
        }
    }

    /// Drops everything without archiving; the engine is going away.
    pub async fn destroy(&self) {
        for entry in self.versions.iter() {
            for instance in entry.value().instances() {
                instance.halt().await;
            }
        }
        self.versions.clear();
        self.instance_ids.clear();
        self.instance_handlers.clear();
        self.user_tasks.write().await.clear();
    }

    pub(crate) fn tokens_at_node<'a>(
        tokens: &'a [Token],
        node_id: &str,
    ) -> Option<&'a Token> {
        tokens
            .iter()
            .find(|t| t.current_node() == node_id && !t.state.is_terminal())
    }
}
