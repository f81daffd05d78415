use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::warn;

use super::hooks::ExecutionHooks;
use crate::model::{
    derive_instance_state, forked_token_id, merged_token_id, now_millis, subprocess_container_id,
    subprocess_token_id, AdaptationEntry, ExecutionState, FlowNodeKind, InstanceSnapshot,
    InstanceState, LogEntry, MachineSummary, ProcessModel, Token, TokenState, VariableChange,
    VariableEntry,
};

/// Token relocation applied during a migration.
#[derive(Debug, Clone)]
pub struct TokenMove {
    pub token_id: String,
    pub target_flow_element_id: String,
}

/// Which model text an instance currently executes against. Swapped as a
/// whole by migrations.
struct Binding {
    process_id: String,
    version: u64,
    model: Arc<ProcessModel>,
}

/// Work items handled one at a time by the instance driver task. Everything
/// that moves tokens goes through here, so token stepping never races.
#[derive(Debug)]
enum Step {
    /// Token arrived at its current node; gate and execute it.
    Enter { token_id: String },
    /// Activation granted for a parked token.
    Begin { token_id: String },
    /// A waiting activity (user task, call activity, external node) finished.
    Complete {
        token_id: String,
        variables: Option<HashMap<String, Value>>,
        changed_by: Option<String>,
    },
    /// Re-run deployment routing for a token stuck in DEPLOYMENT-WAITING.
    Reroute { token_id: String },
    Halt,
}

struct InstanceCore {
    global_start_time: i64,
    pausing: bool,
    /// Lifecycle is controlled from outside (stop, abort, pause); suppress
    /// the automatic end-of-instance handling.
    external_teardown: bool,
    halted: bool,
    ended_fired: bool,
    instance_state: Vec<InstanceState>,
    tokens: Vec<Token>,
    /// Tokens whose end has been fully processed, to keep end_token
    /// idempotent.
    finalized: HashSet<String>,
    variables: HashMap<String, VariableEntry>,
    log: Vec<LogEntry>,
    adaptation_log: Vec<AdaptationEntry>,
    calling_instance: Option<String>,
    /// Parallel join node -> tokens that already arrived.
    merge_arrivals: HashMap<String, Vec<String>>,
    /// Container token -> child counter, for subprocess token ids.
    subprocess_counters: HashMap<String, usize>,
}

impl InstanceCore {
    fn token(&self, id: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.token_id == id)
    }

    fn token_mut(&mut self, id: &str) -> Option<&mut Token> {
        self.tokens.iter_mut().find(|t| t.token_id == id)
    }

    fn take_token(&mut self, id: &str) -> Option<Token> {
        let index = self.tokens.iter().position(|t| t.token_id == id)?;
        Some(self.tokens.remove(index))
    }
}

pub(crate) struct InstanceInit {
    pub id: String,
    pub definition_id: String,
    pub version: u64,
    pub process_id: String,
    pub model: Arc<ProcessModel>,
    pub machine: MachineSummary,
    pub hooks: Arc<dyn ExecutionHooks>,
    pub global_start_time: i64,
    pub tokens: Vec<Token>,
    pub variables: HashMap<String, VariableEntry>,
    pub log: Vec<LogEntry>,
    pub adaptation_log: Vec<AdaptationEntry>,
    pub calling_instance: Option<String>,
    pub pausing: bool,
}

/// One live process instance. All token movement is serialized through the
/// driver task; everything else reads and patches shared state under the
/// core lock and never holds it across hook calls.
pub struct Instance {
    id: String,
    definition_id: String,
    machine: MachineSummary,
    hooks: Arc<dyn ExecutionHooks>,
    binding: RwLock<Binding>,
    core: RwLock<InstanceCore>,
    steps: mpsc::UnboundedSender<Step>,
    change: watch::Sender<u64>,
}

impl Instance {
    pub(crate) fn spawn(init: InstanceInit) -> Arc<Self> {
        let (steps, step_rx) = mpsc::unbounded_channel();
        let (change, _) = watch::channel(0u64);
        let finalized = init
            .tokens
            .iter()
            .filter(|t| t.state.is_terminal())
            .map(|t| t.token_id.clone())
            .collect();
        let instance_state = derive_instance_state(&init.tokens, init.pausing);
        let instance = Arc::new(Instance {
            id: init.id,
            definition_id: init.definition_id,
            machine: init.machine,
            hooks: init.hooks,
            binding: RwLock::new(Binding {
                process_id: init.process_id,
                version: init.version,
                model: init.model,
            }),
            core: RwLock::new(InstanceCore {
                global_start_time: init.global_start_time,
                pausing: init.pausing,
                external_teardown: false,
                halted: false,
                ended_fired: false,
                instance_state,
                tokens: init.tokens,
                finalized,
                variables: init.variables,
                log: init.log,
                adaptation_log: init.adaptation_log,
                calling_instance: init.calling_instance,
                merge_arrivals: HashMap::new(),
                subprocess_counters: HashMap::new(),
            }),
            steps,
            change,
        });
        tokio::spawn(Self::drive(Arc::downgrade(&instance), step_rx));
        instance
    }

    async fn drive(instance: Weak<Instance>, mut steps: mpsc::UnboundedReceiver<Step>) {
        while let Some(step) = steps.recv().await {
            let Some(instance) = instance.upgrade() else {
                break;
            };
            if matches!(step, Step::Halt) {
                break;
            }
            if instance.is_halted().await {
                continue;
            }
            instance.handle(step).await;
        }
    }

    async fn handle(self: &Arc<Self>, step: Step) {
        match step {
            Step::Enter { token_id } => self.enter(&token_id).await,
            Step::Begin { token_id } => self.begin(&token_id).await,
            Step::Complete {
                token_id,
                variables,
                changed_by,
            } => self.complete(&token_id, variables, changed_by).await,
            Step::Reroute { token_id } => self.reroute(&token_id).await,
            Step::Halt => {}
        }
    }

    // --- identity and views ---

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition_id(&self) -> &str {
        &self.definition_id
    }

    pub fn machine(&self) -> &MachineSummary {
        &self.machine
    }

    pub async fn version(&self) -> u64 {
        self.binding.read().await.version
    }

    pub async fn process_id(&self) -> String {
        self.binding.read().await.process_id.clone()
    }

    pub async fn model(&self) -> Arc<ProcessModel> {
        self.binding.read().await.model.clone()
    }

    pub async fn global_start_time(&self) -> i64 {
        self.core.read().await.global_start_time
    }

    pub async fn calling_instance(&self) -> Option<String> {
        self.core.read().await.calling_instance.clone()
    }

    pub async fn set_calling_instance(&self, instance_id: String) {
        self.core.write().await.calling_instance = Some(instance_id);
        self.notify();
    }

    pub async fn token(&self, token_id: &str) -> Option<Token> {
        self.core.read().await.token(token_id).cloned()
    }

    pub async fn tokens(&self) -> Vec<Token> {
        self.core.read().await.tokens.clone()
    }

    pub async fn instance_state(&self) -> Vec<InstanceState> {
        self.core.read().await.instance_state.clone()
    }

    pub async fn is_pausing(&self) -> bool {
        self.core.read().await.pausing
    }

    pub async fn is_halted(&self) -> bool {
        self.core.read().await.halted
    }

    pub async fn is_externally_managed(&self) -> bool {
        self.core.read().await.external_teardown
    }

    /// Bumped on every state mutation; pair with [`Instance::subscribe`] to
    /// wait for quiescence.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change.subscribe()
    }

    fn notify(&self) {
        self.change.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let binding = self.binding.read().await;
        let core = self.core.read().await;
        InstanceSnapshot {
            process_id: binding.process_id.clone(),
            process_instance_id: self.id.clone(),
            global_start_time: core.global_start_time,
            instance_state: core.instance_state.clone(),
            tokens: core.tokens.clone(),
            variables: core.variables.clone(),
            log: core.log.clone(),
            adaptation_log: core.adaptation_log.clone(),
            calling_instance: core.calling_instance.clone(),
        }
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.core
            .read()
            .await
            .variables
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    pub async fn variable_entries(&self) -> HashMap<String, VariableEntry> {
        self.core.read().await.variables.clone()
    }

    // --- mutations from the engine layer ---

    pub async fn set_variables(&self, variables: HashMap<String, Value>, changed_by: &str) {
        let now = now_millis();
        {
            let mut core = self.core.write().await;
            for (name, value) in variables {
                let entry = core.variables.entry(name).or_default();
                entry.value = value;
                entry.log.push(VariableChange {
                    changed_time: now,
                    changed_by: changed_by.to_string(),
                });
            }
        }
        self.notify();
    }

    pub async fn update_token<F: FnOnce(&mut Token)>(&self, token_id: &str, f: F) -> Result<()> {
        {
            let mut core = self.core.write().await;
            let token = core
                .token_mut(token_id)
                .ok_or_else(|| anyhow!("instance {} has no token {token_id}", self.id))?;
            f(token);
        }
        self.notify();
        Ok(())
    }

    /// Amends the latest log entry of a flow node execution, e.g. with the
    /// machine a token went on to.
    pub async fn update_log<F: FnOnce(&mut LogEntry)>(
        &self,
        flow_element_id: &str,
        token_id: &str,
        f: F,
    ) {
        {
            let mut core = self.core.write().await;
            if let Some(entry) = core
                .log
                .iter_mut()
                .rev()
                .find(|e| e.flow_element_id == flow_element_id && e.token_id == token_id)
            {
                f(entry);
            }
        }
        self.notify();
    }

    /// Appends an execution log entry outside the normal completion path,
    /// used when tokens are force-ended mid-node.
    pub async fn log_execution(
        &self,
        flow_element_id: &str,
        token_id: &str,
        state: ExecutionState,
        error_message: Option<String>,
    ) {
        let now = now_millis();
        {
            let mut core = self.core.write().await;
            let start_time = core
                .token(token_id)
                .and_then(|t| t.current_flow_element_start_time)
                .unwrap_or(now);
            core.log.push(LogEntry {
                flow_element_id: flow_element_id.to_string(),
                token_id: token_id.to_string(),
                execution_state: state,
                start_time,
                end_time: now,
                machine: self.machine.clone(),
                next_machine: None,
                error_message,
                progress: None,
                milestones: HashMap::new(),
                priority: None,
                performers: Vec::new(),
                external: false,
                called_instance: None,
            });
        }
        self.notify();
    }

    pub async fn append_adaptation(&self, entry: AdaptationEntry) {
        self.core.write().await.adaptation_log.push(entry);
        self.notify();
    }

    /// Merge-in of instance data arriving with a returning token.
    pub async fn merge_incoming(&self, incoming: &InstanceSnapshot) {
        {
            let mut core = self.core.write().await;
            for (name, entry) in &incoming.variables {
                core.variables.insert(name.clone(), entry.clone());
            }
            if incoming.log.len() > core.log.len() {
                core.log = incoming.log.clone();
            }
            if incoming.adaptation_log.len() > core.adaptation_log.len() {
                core.adaptation_log = incoming.adaptation_log.clone();
            }
        }
        self.notify();
    }

    /// Inserts (or re-inserts) a token at a node and schedules its entry.
    pub async fn place_token_at(&self, mut token: Token, node_id: &str) {
        token.state = TokenState::Ready;
        token.previous_flow_element_id = token.from.take();
        token.current_flow_element_id = Some(node_id.to_string());
        token.current_flow_element_start_time = None;
        token.end_time = None;
        token.to = None;
        let token_id = token.token_id.clone();
        {
            let mut core = self.core.write().await;
            core.tokens.retain(|t| t.token_id != token_id);
            core.finalized.remove(&token_id);
            core.tokens.push(token);
        }
        self.notify();
        let _ = self.steps.send(Step::Enter { token_id });
    }

    /// Grants activation to a parked token.
    pub fn begin_activity(&self, token_id: &str) -> Result<()> {
        self.steps
            .send(Step::Begin {
                token_id: token_id.to_string(),
            })
            .map_err(|_| anyhow!("instance {} no longer accepts steps", self.id))
    }

    /// Completes a waiting activity, optionally writing variables first.
    pub fn complete_activity(
        &self,
        token_id: &str,
        variables: Option<HashMap<String, Value>>,
        changed_by: Option<String>,
    ) -> Result<()> {
        self.steps
            .send(Step::Complete {
                token_id: token_id.to_string(),
                variables,
                changed_by,
            })
            .map_err(|_| anyhow!("instance {} no longer accepts steps", self.id))
    }

    pub(crate) fn schedule_enter(&self, token_id: &str) {
        let _ = self.steps.send(Step::Enter {
            token_id: token_id.to_string(),
        });
    }

    pub(crate) fn schedule_reroute(&self, token_id: &str) {
        let _ = self.steps.send(Step::Reroute {
            token_id: token_id.to_string(),
        });
    }

    // --- lifecycle control ---

    pub async fn set_pausing(self: &Arc<Self>) {
        {
            let mut core = self.core.write().await;
            if core.pausing {
                return;
            }
            core.pausing = true;
        }
        self.state_changed().await;
    }

    pub async fn pause_token(self: &Arc<Self>, token_id: &str) -> Result<()> {
        let snapshot = {
            let mut core = self.core.write().await;
            let token = core
                .token_mut(token_id)
                .ok_or_else(|| anyhow!("instance {} has no token {token_id}", self.id))?;
            if token.state.is_terminal() || token.state == TokenState::Paused {
                return Ok(());
            }
            token.state = TokenState::Paused;
            token.clone()
        };
        self.notify();
        self.fire_interruption(&snapshot).await;
        self.state_changed().await;
        Ok(())
    }

    /// Ends a token. With `state` None a non-terminal token ends as ENDED and
    /// an already-terminal one keeps its state. Idempotent per token.
    pub async fn end_token(
        self: &Arc<Self>,
        token_id: &str,
        state: Option<TokenState>,
        error_message: Option<String>,
    ) -> Result<()> {
        let snapshot = {
            let mut core = self.core.write().await;
            if core.finalized.contains(token_id) {
                return Ok(());
            }
            let id = self.id.clone();
            let token = core
                .token_mut(token_id)
                .ok_or_else(|| anyhow!("instance {id} has no token {token_id}"))?;
            let final_state = match state {
                Some(s) => s,
                None if token.state.is_terminal() => token.state,
                None => TokenState::Ended,
            };
            token.state = final_state;
            if token.end_time.is_none() {
                token.end_time = Some(now_millis());
            }
            if let Some(message) = error_message {
                token.error_message = Some(message);
            }
            let snapshot = token.clone();
            core.finalized.insert(token_id.to_string());
            snapshot
        };
        self.notify();
        if !matches!(snapshot.state, TokenState::Ended | TokenState::Forwarded) {
            self.fire_interruption(&snapshot).await;
        }
        self.hooks.on_token_ended(self, &snapshot).await;
        self.after_token_end(&snapshot).await;
        self.state_changed().await;
        Ok(())
    }

    async fn fire_interruption(self: &Arc<Self>, token: &Token) {
        let model = self.model().await;
        match model.node(token.current_node()).map(|n| &n.kind) {
            Some(FlowNodeKind::UserTask { .. }) => {
                self.hooks.on_user_task_interrupted(self, token).await;
            }
            Some(FlowNodeKind::CallActivity) if token.called_instance.is_some() => {
                self.hooks.on_call_activity_interrupted(self, token).await;
            }
            _ => {}
        }
    }

    /// Marks the lifecycle as driven from outside; the automatic on_ended
    /// handling stays quiet from here on.
    pub async fn mark_external_teardown(&self) {
        self.core.write().await.external_teardown = true;
    }

    /// Turns every remaining live token PAUSED and freezes the instance.
    pub async fn finalize_pause(self: &Arc<Self>) {
        {
            let mut core = self.core.write().await;
            core.external_teardown = true;
            for token in &mut core.tokens {
                if !token.state.is_terminal() {
                    token.state = TokenState::Paused;
                }
            }
            core.pausing = false;
            core.instance_state = derive_instance_state(&core.tokens, false);
            core.halted = true;
        }
        self.notify();
        let _ = self.steps.send(Step::Halt);
    }

    pub async fn halt(&self) {
        self.core.write().await.halted = true;
        let _ = self.steps.send(Step::Halt);
    }

    /// Rebinds the instance to another model version and relocates tokens.
    pub async fn apply_migration(
        &self,
        process_id: String,
        version: u64,
        model: Arc<ProcessModel>,
        moves: &[TokenMove],
    ) -> Result<()> {
        for m in moves {
            if model.node(&m.target_flow_element_id).is_none() {
                return Err(anyhow!(
                    "migration target {} does not exist in version {version}",
                    m.target_flow_element_id
                ));
            }
        }
        {
            let mut binding = self.binding.write().await;
            *binding = Binding {
                process_id,
                version,
                model,
            };
        }
        let ready: Vec<String> = {
            let mut core = self.core.write().await;
            for m in moves {
                let token = core
                    .token_mut(&m.token_id)
                    .ok_or_else(|| anyhow!("instance {} has no token {}", self.id, m.token_id))?;
                token.current_flow_element_id = Some(m.target_flow_element_id.clone());
                token.current_flow_element_start_time = None;
            }
            core.tokens
                .iter()
                .filter(|t| t.state == TokenState::Ready)
                .map(|t| t.token_id.clone())
                .collect()
        };
        self.notify();
        for token_id in ready {
            self.schedule_enter(&token_id);
        }
        Ok(())
    }

    // --- driver steps ---

    async fn enter(self: &Arc<Self>, token_id: &str) {
        let node_id = {
            let mut core = self.core.write().await;
            let Some(token) = core.token_mut(token_id) else {
                return;
            };
            if token.state != TokenState::Ready {
                return;
            }
            if token.current_flow_element_start_time.is_none() {
                token.current_flow_element_start_time = Some(now_millis());
            }
            token.current_node().to_string()
        };
        self.notify();
        let model = self.model().await;
        if model.node(&node_id).is_none() {
            let _ = self
                .end_token(
                    token_id,
                    Some(TokenState::Failed),
                    Some(format!("unknown flow node {node_id}")),
                )
                .await;
            return;
        }
        if !self
            .hooks
            .should_activate_flow_node(self, token_id, &node_id)
            .await
        {
            // Parked READY; a later begin_activity moves it on.
            return;
        }
        self.begin(token_id).await;
    }

    async fn begin(self: &Arc<Self>, token_id: &str) {
        let node_id = {
            let mut core = self.core.write().await;
            let Some(token) = core.token_mut(token_id) else {
                return;
            };
            match token.state {
                TokenState::Ready => token.state = TokenState::Running,
                TokenState::Running => {}
                _ => return,
            }
            if token.current_flow_element_start_time.is_none() {
                token.current_flow_element_start_time = Some(now_millis());
            }
            token.current_node().to_string()
        };
        self.notify();
        let model = self.model().await;
        let Some(node) = model.node(&node_id) else {
            return;
        };
        match node.kind {
            FlowNodeKind::StartEvent | FlowNodeKind::Task | FlowNodeKind::ScriptTask => {
                self.finish_node(token_id).await;
                self.transition(token_id).await;
            }
            FlowNodeKind::EndEvent => {
                self.finish_node(token_id).await;
                let _ = self.end_token(token_id, Some(TokenState::Ended), None).await;
            }
            FlowNodeKind::UserTask { .. } | FlowNodeKind::CallActivity => {
                // Waiting activity; a Complete step finishes it.
            }
            FlowNodeKind::ParallelGateway => self.parallel_gateway(token_id, &node_id).await,
            FlowNodeKind::SubProcess => self.enter_subprocess(token_id, &node_id).await,
        }
    }

    async fn complete(
        self: &Arc<Self>,
        token_id: &str,
        variables: Option<HashMap<String, Value>>,
        changed_by: Option<String>,
    ) {
        let node_id = {
            let mut core = self.core.write().await;
            match core.token_mut(token_id) {
                Some(token)
                    if matches!(token.state, TokenState::Ready | TokenState::Running) =>
                {
                    token.state = TokenState::Running;
                    token.intermediate_variables_state = None;
                    if token.current_flow_element_start_time.is_none() {
                        token.current_flow_element_start_time = Some(now_millis());
                    }
                    token.current_node().to_string()
                }
                _ => {
                    warn!(
                        instance_id = %self.id,
                        token_id, "completion arrived for a token that is not active"
                    );
                    return;
                }
            }
        };
        self.notify();
        if let Some(variables) = variables {
            let changed_by = changed_by.unwrap_or_else(|| node_id.clone());
            self.set_variables(variables, &changed_by).await;
        }
        self.finish_node(token_id).await;
        self.transition(token_id).await;
    }

    async fn reroute(self: &Arc<Self>, token_id: &str) {
        let current = match self.token(token_id).await {
            Some(t) if t.state == TokenState::DeploymentWaiting => t.current_node().to_string(),
            _ => return,
        };
        let model = self.model().await;
        let Some(target) = model
            .outgoing(&current)
            .first()
            .map(|f| f.target_ref.clone())
        else {
            let _ = self.end_token(token_id, Some(TokenState::Ended), None).await;
            return;
        };
        self.cross(token_id, &current, &target).await;
    }

    /// Books the completed node into the log and lets the engine stamp it.
    async fn finish_node(self: &Arc<Self>, token_id: &str) {
        let now = now_millis();
        let snapshot = {
            let mut core = self.core.write().await;
            let machine = self.machine.clone();
            let Some(token) = core.token_mut(token_id) else {
                return;
            };
            let start_time = token.current_flow_element_start_time.unwrap_or(now);
            token.local_execution_time += now - start_time;
            let entry = LogEntry {
                flow_element_id: token.current_node().to_string(),
                token_id: token.token_id.clone(),
                execution_state: ExecutionState::Completed,
                start_time,
                end_time: now,
                machine,
                next_machine: None,
                error_message: None,
                progress: None,
                milestones: HashMap::new(),
                priority: None,
                performers: Vec::new(),
                external: false,
                called_instance: None,
            };
            let snapshot = token.clone();
            core.log.push(entry);
            snapshot
        };
        self.notify();
        self.hooks.on_flow_node_executed(self, &snapshot).await;
    }

    async fn transition(self: &Arc<Self>, token_id: &str) {
        let from = match self.token(token_id).await {
            Some(t) if !t.state.is_terminal() => t.current_node().to_string(),
            _ => return,
        };
        let model = self.model().await;
        let Some(target) = model.outgoing(&from).first().map(|f| f.target_ref.clone()) else {
            // Dead end without an end event still ends the token normally.
            let _ = self.end_token(token_id, Some(TokenState::Ended), None).await;
            return;
        };
        self.cross(token_id, &from, &target).await;
    }

    /// Carries a token across one sequence flow, subject to the routing gate.
    async fn cross(self: &Arc<Self>, token_id: &str, from: &str, to: &str) {
        if self.hooks.should_pass_token(self, from, to, token_id).await {
            {
                let mut core = self.core.write().await;
                if let Some(token) = core.token_mut(token_id) {
                    token.previous_flow_element_id = Some(from.to_string());
                    token.current_flow_element_id = Some(to.to_string());
                    token.current_flow_element_start_time = None;
                    token.state = TokenState::Ready;
                    token.flow_element_execution_was_interrupted = false;
                }
            }
            self.notify();
            let _ = self.steps.send(Step::Enter {
                token_id: token_id.to_string(),
            });
        } else {
            // The gate took over. A token it forwarded still needs its
            // wrap-up here; one it ended was finalized by end_token already.
            if let Some(TokenState::Forwarded) = self.token(token_id).await.map(|t| t.state) {
                let _ = self.end_token(token_id, None, None).await;
            }
        }
    }

    async fn parallel_gateway(self: &Arc<Self>, token_id: &str, node_id: &str) {
        let model = self.model().await;
        let incoming = model.incoming_count(node_id);
        let outgoing: Vec<String> = model
            .outgoing(node_id)
            .iter()
            .map(|f| f.target_ref.clone())
            .collect();
        if incoming > 1 {
            self.join_gateway(token_id, node_id, incoming, &outgoing).await;
        } else if outgoing.len() > 1 {
            self.finish_node(token_id).await;
            self.fork(token_id, node_id, &outgoing).await;
        } else {
            self.finish_node(token_id).await;
            self.transition(token_id).await;
        }
    }

    async fn join_gateway(
        self: &Arc<Self>,
        token_id: &str,
        node_id: &str,
        incoming: usize,
        outgoing: &[String],
    ) {
        let merged: Option<Token> = {
            let mut core = self.core.write().await;
            let arrivals = core.merge_arrivals.entry(node_id.to_string()).or_default();
            if !arrivals.iter().any(|id| id == token_id) {
                arrivals.push(token_id.to_string());
            }
            if arrivals.len() < incoming {
                // Park until the siblings arrive.
                if let Some(token) = core.token_mut(token_id) {
                    token.state = TokenState::Ready;
                }
                None
            } else {
                let arrival_ids = core.merge_arrivals.remove(node_id).unwrap_or_default();
                let mut collected = Vec::new();
                core.tokens.retain(|t| {
                    if arrival_ids.iter().any(|id| *id == t.token_id) {
                        collected.push(t.clone());
                        false
                    } else {
                        true
                    }
                });
                match collected.first().cloned() {
                    None => None,
                    Some(first) => {
                        // The branches continue as one token under the shared
                        // parent id, keeping the heaviest bookkeeping.
                        let mut token = first.clone();
                        token.token_id = merged_token_id(&first.token_id)
                            .map(str::to_string)
                            .unwrap_or_else(|| first.token_id.clone());
                        token.state = TokenState::Running;
                        token.current_flow_element_id = Some(node_id.to_string());
                        token.current_flow_element_start_time = collected
                            .iter()
                            .filter_map(|t| t.current_flow_element_start_time)
                            .min()
                            .or(Some(now_millis()));
                        token.machine_hops =
                            collected.iter().map(|t| t.machine_hops).max().unwrap_or(0);
                        token.local_execution_time = collected
                            .iter()
                            .map(|t| t.local_execution_time)
                            .max()
                            .unwrap_or(0);
                        core.tokens.push(token.clone());
                        Some(token)
                    }
                }
            }
        };
        self.notify();
        let Some(token) = merged else {
            return;
        };
        self.finish_node(&token.token_id).await;
        if outgoing.len() > 1 {
            self.fork(&token.token_id, node_id, outgoing).await;
        } else {
            self.transition(&token.token_id).await;
        }
    }

    async fn fork(self: &Arc<Self>, token_id: &str, node_id: &str, outgoing: &[String]) {
        let children: Vec<(String, String)> = {
            let mut core = self.core.write().await;
            let Some(parent) = core.take_token(token_id) else {
                return;
            };
            let mut children = Vec::new();
            for (i, target) in outgoing.iter().enumerate() {
                let mut child = parent.clone();
                child.token_id = forked_token_id(&parent.token_id, i + 1);
                child.state = TokenState::Ready;
                child.current_flow_element_start_time = None;
                children.push((child.token_id.clone(), target.clone()));
                core.tokens.push(child);
            }
            children
        };
        self.notify();
        for (child_id, target) in children {
            self.cross(&child_id, node_id, &target).await;
        }
    }

    async fn enter_subprocess(self: &Arc<Self>, token_id: &str, node_id: &str) {
        let model = self.model().await;
        let Some(start) = model.subprocess_start_node(node_id) else {
            let _ = self
                .end_token(
                    token_id,
                    Some(TokenState::Failed),
                    Some(format!("subprocess {node_id} has no start event")),
                )
                .await;
            return;
        };
        let start_id = start.id.clone();
        let child_id = {
            let mut core = self.core.write().await;
            let Some(hops) = core.token(token_id).map(|t| t.machine_hops) else {
                return;
            };
            let counter = core.subprocess_counters.entry(token_id.to_string()).or_insert(0);
            *counter += 1;
            let child_id = subprocess_token_id(token_id, *counter);
            let mut child = Token::fresh(child_id.clone(), start_id);
            child.machine_hops = hops;
            core.tokens.push(child);
            child_id
        };
        self.notify();
        let _ = self.steps.send(Step::Enter { token_id: child_id });
    }

    /// Subprocess wrap-up when one of the container's child tokens ended.
    async fn after_token_end(self: &Arc<Self>, ended: &Token) {
        let Some(container_id) = subprocess_container_id(&ended.token_id) else {
            return;
        };
        let container_id = container_id.to_string();
        let (container_waiting, live_children) = {
            let core = self.core.read().await;
            let container_waiting = core
                .token(&container_id)
                .map(|t| t.state == TokenState::Running)
                .unwrap_or(false);
            let live_children = core.tokens.iter().any(|t| {
                t.token_id != ended.token_id
                    && subprocess_container_id(&t.token_id) == Some(container_id.as_str())
                    && !t.state.is_terminal()
            });
            (container_waiting, live_children)
        };
        if !container_waiting || live_children {
            return;
        }
        match ended.state {
            TokenState::Ended => {
                self.finish_node(&container_id).await;
                Box::pin(self.transition(&container_id)).await;
            }
            state => {
                // A failing body takes the container down with it.
                let _ = Box::pin(self.end_token(
                    &container_id,
                    Some(state),
                    ended.error_message.clone(),
                ))
                .await;
            }
        }
    }

    async fn state_changed(self: &Arc<Self>) {
        let (changed, states, fire_ended) = {
            let mut core = self.core.write().await;
            let states = derive_instance_state(&core.tokens, core.pausing);
            let changed = states != core.instance_state;
            if changed {
                core.instance_state = states.clone();
            }
            let all_terminal =
                !core.tokens.is_empty() && core.tokens.iter().all(|t| t.state.is_terminal());
            let interrupted = core
                .tokens
                .iter()
                .any(|t| t.state == TokenState::ErrorInterrupted);
            // ERROR-INTERRUPTED is not a natural end; the instance stays
            // live for manual handling.
            let fire_ended =
                all_terminal && !interrupted && !core.ended_fired && !core.external_teardown;
            if fire_ended {
                core.ended_fired = true;
                core.halted = true;
            }
            (changed, states, fire_ended)
        };
        if changed {
            self.notify();
            self.hooks.on_instance_state_change(self, &states).await;
        }
        if fire_ended {
            self.hooks.on_ended(self).await;
        }
    }
}
