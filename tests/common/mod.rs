#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use prozess::config::EngineConfig;
use prozess::context::EngineContext;
use prozess::decider::{
    AbortCheck, CandidateEngine, Decider, MachineResult, ProcessInfo, TokenInfo,
};
use prozess::engine::{Engine, InstanceEventHandlers, InstanceInformation};
use prozess::management::Management;
use prozess::model::{
    Constraint, ConstraintSet, InstanceSnapshot, Token, TokenState, UserTaskRecord,
};
use prozess::network::MachineNetwork;
use prozess::runtime::Instance;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- network mock ---

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub ip: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

/// In-memory transport. Records everything, can fail selected targets and
/// answer identity probes.
pub struct MockNetwork {
    requests: Mutex<Vec<SentRequest>>,
    fail_targets: DashSet<String>,
    probes: DashMap<String, Value>,
}

impl MockNetwork {
    pub fn new() -> Self {
        MockNetwork {
            requests: Mutex::new(Vec::new()),
            fail_targets: DashSet::new(),
            probes: DashMap::new(),
        }
    }

    pub fn fail_target(&self, ip: &str, port: u16) {
        self.fail_targets.insert(format!("{ip}:{port}"));
    }

    pub fn heal_target(&self, ip: &str, port: u16) {
        self.fail_targets.remove(&format!("{ip}:{port}"));
    }

    pub fn answer_probe(&self, ip: &str, port: u16, id: &str) {
        self.probes
            .insert(format!("{ip}:{port}"), json!({ "id": id }));
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn sent_to_path(&self, fragment: &str) -> Vec<SentRequest> {
        self.sent()
            .into_iter()
            .filter(|r| r.path.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl MachineNetwork for MockNetwork {
    async fn request(
        &self,
        ip: &str,
        port: u16,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let key = format!("{ip}:{port}");
        self.requests.lock().unwrap().push(SentRequest {
            ip: ip.to_string(),
            port,
            method: method.to_string(),
            path: path.to_string(),
            body: body.cloned(),
        });
        if self.fail_targets.contains(&key) {
            return Err(anyhow!("{key} is unreachable"));
        }
        if path.starts_with("machine/") {
            if let Some(probe) = self.probes.get(&key) {
                return Ok(probe.clone());
            }
            return Ok(json!({ "id": format!("machine-at-{key}") }));
        }
        Ok(Value::Null)
    }
}

// --- decider mock ---

/// Decider with scripted answers. With nothing scripted every token stays
/// local, which keeps non-routing tests simple.
pub struct MockDecider {
    results: Mutex<VecDeque<MachineResult>>,
    allow_local_start: AtomicBool,
}

impl MockDecider {
    pub fn new() -> Self {
        MockDecider {
            results: Mutex::new(VecDeque::new()),
            allow_local_start: AtomicBool::new(true),
        }
    }

    pub fn refuse_local_start(&self) {
        self.allow_local_start.store(false, Ordering::SeqCst);
    }

    pub fn push_result(&self, result: MachineResult) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn push_candidates(&self, candidates: Vec<CandidateEngine>) {
        self.push_result(MachineResult {
            engine_list: candidates,
            prioritized: true,
            abort_check: AbortCheck::default(),
        });
    }

    pub fn push_abort(&self, abort: AbortCheck) {
        self.push_result(MachineResult {
            abort_check: abort,
            ..Default::default()
        });
    }
}

#[async_trait]
impl Decider for MockDecider {
    async fn find_optimal_next_machine(
        &self,
        _process: &ProcessInfo,
        _token: &TokenInfo,
        _flow_node_constraints: &ConstraintSet,
        _process_constraints: &ConstraintSet,
    ) -> Result<MachineResult> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MachineResult {
                engine_list: vec![CandidateEngine::local()],
                ..Default::default()
            }))
    }

    async fn pre_check_abort(
        &self,
        _process: &ProcessInfo,
        _token: &TokenInfo,
        _previous_node_constraints: &[Constraint],
        _process_constraints: &[Constraint],
    ) -> Result<AbortCheck> {
        Ok(AbortCheck::default())
    }

    async fn allowed_to_execute_locally(
        &self,
        _process: &ProcessInfo,
        _token: &TokenInfo,
        _flow_node_constraints: &ConstraintSet,
        _process_constraints: &ConstraintSet,
    ) -> Result<bool> {
        Ok(self.allow_local_start.load(Ordering::SeqCst))
    }
}

// --- engine setup ---

pub struct TestBed {
    pub ctx: Arc<EngineContext>,
    pub management: Arc<Management>,
    pub network: Arc<MockNetwork>,
    pub decider: Arc<MockDecider>,
}

pub fn test_config(machine_id: &str) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.machine.id = Some(machine_id.to_string());
    // Keep routing re-evaluation fast enough for tests.
    config.router.re_evaluate_timer_ms = 20;
    config
}

pub fn test_bed(config: EngineConfig) -> TestBed {
    let network = Arc::new(MockNetwork::new());
    let decider = Arc::new(MockDecider::new());
    let ctx = Arc::new(
        EngineContext::new(config)
            .with_network(network.clone())
            .with_decider(decider.clone()),
    );
    TestBed {
        management: Management::new(ctx.clone()),
        ctx,
        network,
        decider,
    }
}

pub async fn deploy(bed: &TestBed, model: &Value, version: u64) {
    let definition_id = model["id"].as_str().expect("model has no id");
    bed.ctx
        .storage
        .save_process_version(definition_id, version, &model.to_string())
        .await
        .expect("failed to store the model");
    // Deployment validity wants every referenced task form stored too.
    if let Some(nodes) = model["flowNodes"].as_array() {
        for node in nodes {
            if let Some(file) = node["fileName"].as_str() {
                bed.ctx
                    .storage
                    .save_html(definition_id, file, "<form></form>")
                    .await
                    .expect("failed to store the task form");
            }
        }
    }
}

// --- waiting ---

pub fn ended_channel() -> (
    InstanceEventHandlers,
    tokio::sync::mpsc::UnboundedReceiver<InstanceSnapshot>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let handlers = InstanceEventHandlers {
        on_ended: Some(Box::new(move |snapshot| {
            let _ = tx.send(snapshot.clone());
        })),
        ..Default::default()
    };
    (handlers, rx)
}

pub async fn recv_ended(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<InstanceSnapshot>,
) -> InstanceSnapshot {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("instance did not end in time")
        .expect("ended channel closed")
}

/// Polls until a pending user task matches, failing the test after a few
/// seconds.
pub async fn wait_for_pending_task_where<F>(
    management: &Arc<Management>,
    what: &str,
    matches: F,
) -> UserTaskRecord
where
    F: Fn(&UserTaskRecord) -> bool,
{
    for _ in 0..500 {
        let found = management
            .get_pending_user_tasks()
            .await
            .into_iter()
            .find(|r| matches(r));
        if let Some(record) = found {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting for {what}");
}

pub async fn wait_for_pending_task(management: &Arc<Management>) -> UserTaskRecord {
    wait_for_pending_task_where(management, "a user task to register", |_| true).await
}

pub async fn wait_for_instance_gone(engine: &Arc<Engine>, instance_id: &str) {
    for _ in 0..500 {
        if !engine.has_instance(instance_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting for instance {instance_id} to be dropped");
}

pub async fn wait_for_token_state(instance: &Arc<Instance>, token_id: &str, state: TokenState) {
    for _ in 0..500 {
        if instance.token(token_id).await.map(|t| t.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting for token {token_id} to reach {state:?}");
}

/// Polls until some live token matches, failing the test after a few seconds.
pub async fn wait_for_token_where<F>(instance: &Arc<Instance>, what: &str, matches: F) -> Token
where
    F: Fn(&Token) -> bool,
{
    for _ in 0..500 {
        let found = instance.tokens().await.into_iter().find(|t| matches(t));
        if let Some(token) = found {
            return token;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting for {what}");
}

/// Waits until the instance left the engine and its final archive is written.
pub async fn wait_for_final_archive(
    engine: &Arc<Engine>,
    instance_id: &str,
) -> InstanceInformation {
    for _ in 0..500 {
        if !engine.has_instance(instance_id) {
            if let Ok(info) = engine.get_instance_information(instance_id).await {
                if !info.archive.is_currently_executed_in_bpmn_engine {
                    return info;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gave up waiting for instance {instance_id} to archive");
}

// --- process models ---

pub fn linear_model(id: &str) -> Value {
    json!({
        "id": id,
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "work", "type": "task" },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "work" },
            { "id": "f2", "sourceRef": "work", "targetRef": "finish" },
        ],
    })
}

pub fn user_task_model(id: &str) -> Value {
    json!({
        "id": id,
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            {
                "id": "approve",
                "type": "userTask",
                "fileName": "approve.html",
                "defaultPriority": 3,
                "milestones": [{ "id": "ms1" }, { "id": "ms2" }],
            },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "approve" },
            { "id": "f2", "sourceRef": "approve", "targetRef": "finish" },
        ],
    })
}

pub fn parallel_model(id: &str) -> Value {
    json!({
        "id": id,
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "split", "type": "parallelGateway" },
            { "id": "left", "type": "task" },
            { "id": "right", "type": "task" },
            { "id": "join", "type": "parallelGateway" },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "split" },
            { "id": "f2", "sourceRef": "split", "targetRef": "left" },
            { "id": "f3", "sourceRef": "split", "targetRef": "right" },
            { "id": "f4", "sourceRef": "left", "targetRef": "join" },
            { "id": "f5", "sourceRef": "right", "targetRef": "join" },
            { "id": "f6", "sourceRef": "join", "targetRef": "finish" },
        ],
    })
}

pub fn subprocess_model(id: &str) -> Value {
    json!({
        "id": id,
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "prepare", "type": "subProcess" },
            { "id": "inner_start", "type": "startEvent", "parent": "prepare" },
            { "id": "inner_work", "type": "task", "parent": "prepare" },
            { "id": "inner_end", "type": "endEvent", "parent": "prepare" },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "prepare" },
            { "id": "f2", "sourceRef": "inner_start", "targetRef": "inner_work" },
            { "id": "f3", "sourceRef": "inner_work", "targetRef": "inner_end" },
            { "id": "f4", "sourceRef": "prepare", "targetRef": "finish" },
        ],
    })
}

/// Caller with one call activity bound to `child_id` version 1.
pub fn caller_model(id: &str, child_id: &str) -> Value {
    json!({
        "id": id,
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "call", "type": "callActivity" },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "call" },
            { "id": "f2", "sourceRef": "call", "targetRef": "finish" },
        ],
        "imports": [
            { "callActivityId": "call", "definitionId": child_id, "version": 1 },
        ],
    })
}

/// Statically deployed three-node process; `work` is bound to `machine_id`.
pub fn static_model(id: &str, machine_id: &str) -> Value {
    json!({
        "id": id,
        "deploymentMethod": "static",
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "work", "type": "task", "machineId": machine_id },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "work" },
            { "id": "f2", "sourceRef": "work", "targetRef": "finish" },
        ],
    })
}

/// Like [`static_model`] but bound by address instead of id.
pub fn static_address_model(id: &str, address: &str) -> Value {
    json!({
        "id": id,
        "deploymentMethod": "static",
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "work", "type": "task", "machineAddress": address },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "work" },
            { "id": "f2", "sourceRef": "work", "targetRef": "finish" },
        ],
    })
}

pub fn dynamic_model(id: &str) -> Value {
    json!({
        "id": id,
        "deploymentMethod": "dynamic",
        "flowNodes": [
            { "id": "start", "type": "startEvent" },
            { "id": "work", "type": "task" },
            { "id": "finish", "type": "endEvent" },
        ],
        "sequenceFlows": [
            { "id": "f1", "sourceRef": "start", "targetRef": "work" },
            { "id": "f2", "sourceRef": "work", "targetRef": "finish" },
        ],
    })
}

pub fn peer(id: &str, ip: &str, port: u16) -> prozess::model::Machine {
    prozess::model::Machine {
        id: id.to_string(),
        name: None,
        hostname: None,
        ip: ip.to_string(),
        port,
        properties: Default::default(),
    }
}

pub fn remote_candidate(id: &str, ip: &str, port: u16) -> CandidateEngine {
    CandidateEngine::from_machine(&peer(id, ip, port))
}
