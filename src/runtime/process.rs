use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::hooks::ExecutionHooks;
use super::instance::{Instance, InstanceInit};
use crate::model::{
    join_process_id, now_millis, AdaptationEntry, LogEntry, MachineSummary, ProcessModel, Token,
    TokenState, VariableEntry,
};

/// Where a fresh instance places its first token.
pub enum StartPosition {
    /// The process start event.
    Default,
    /// Directly at the named activity, skipping everything before it.
    AtActivity(String),
}

/// Everything needed to revive an instance from imported or archived state.
pub struct InstanceSeed {
    pub instance_id: String,
    pub global_start_time: Option<i64>,
    pub tokens: Vec<Token>,
    pub variables: HashMap<String, VariableEntry>,
    pub log: Vec<LogEntry>,
    pub adaptation_log: Vec<AdaptationEntry>,
    pub calling_instance: Option<String>,
    pub pausing: bool,
}

/// One deployed version of a process and the instances running on it.
pub struct DeployedProcess {
    process_id: String,
    definition_id: String,
    version: u64,
    model: Arc<ProcessModel>,
    machine: MachineSummary,
    hooks: Arc<dyn ExecutionHooks>,
    instances: DashMap<String, Arc<Instance>>,
}

impl DeployedProcess {
    pub fn new(
        definition_id: &str,
        version: u64,
        model: Arc<ProcessModel>,
        machine: MachineSummary,
        hooks: Arc<dyn ExecutionHooks>,
    ) -> Self {
        DeployedProcess {
            process_id: join_process_id(definition_id, version),
            definition_id: definition_id.to_string(),
            version,
            model,
            machine,
            hooks,
            instances: DashMap::new(),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn model(&self) -> Arc<ProcessModel> {
        self.model.clone()
    }

    /// Starts a new instance with a single token at `position`.
    pub async fn start_instance(
        &self,
        instance_id: String,
        variables: HashMap<String, Value>,
        position: StartPosition,
        calling_instance: Option<String>,
    ) -> Result<Arc<Instance>> {
        let node_id = match position {
            StartPosition::Default => self
                .model
                .start_node()
                .map(|n| n.id.clone())
                .ok_or_else(|| anyhow!("process {} has no start event", self.process_id))?,
            StartPosition::AtActivity(id) => {
                if self.model.node(&id).is_none() {
                    return Err(anyhow!("process {} has no flow node {id}", self.process_id));
                }
                id
            }
        };
        let token = Token::fresh(Uuid::new_v4().to_string(), node_id);
        let token_id = token.token_id.clone();
        let variables = variables
            .into_iter()
            .map(|(name, value)| (name, VariableEntry { value, log: Vec::new() }))
            .collect();
        let instance = Instance::spawn(InstanceInit {
            id: instance_id,
            definition_id: self.definition_id.clone(),
            version: self.version,
            process_id: self.process_id.clone(),
            model: self.model.clone(),
            machine: self.machine.clone(),
            hooks: self.hooks.clone(),
            global_start_time: now_millis(),
            tokens: vec![token],
            variables,
            log: Vec::new(),
            adaptation_log: Vec::new(),
            calling_instance,
            pausing: false,
        });
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        info!(
            process_id = %self.process_id,
            instance_id = %instance.id(),
            "starting instance"
        );
        self.hooks.on_started(&instance).await;
        instance.schedule_enter(&token_id);
        Ok(instance)
    }

    /// Revives an instance from existing tokens. READY tokens re-enter their
    /// node, DEPLOYMENT-WAITING ones re-run routing, everything else stays
    /// put. A pausing seed is imported without scheduling anything.
    pub async fn start_with_state(&self, seed: InstanceSeed) -> Result<Arc<Instance>> {
        if seed.tokens.is_empty() {
            return Err(anyhow!(
                "instance {} arrived without tokens",
                seed.instance_id
            ));
        }
        let pausing = seed.pausing;
        let instance = Instance::spawn(InstanceInit {
            id: seed.instance_id,
            definition_id: self.definition_id.clone(),
            version: self.version,
            process_id: self.process_id.clone(),
            model: self.model.clone(),
            machine: self.machine.clone(),
            hooks: self.hooks.clone(),
            global_start_time: seed.global_start_time.unwrap_or_else(now_millis),
            tokens: seed.tokens,
            variables: seed.variables,
            log: seed.log,
            adaptation_log: seed.adaptation_log,
            calling_instance: seed.calling_instance,
            pausing,
        });
        self.instances
            .insert(instance.id().to_string(), instance.clone());
        self.hooks.on_started(&instance).await;
        if !pausing {
            for token in instance.tokens().await {
                match token.state {
                    TokenState::Ready => instance.schedule_enter(&token.token_id),
                    TokenState::DeploymentWaiting => instance.schedule_reroute(&token.token_id),
                    _ => {}
                }
            }
        }
        Ok(instance)
    }

    /// Takes over an already-running instance, used when a migration moves it
    /// between versions.
    pub fn adopt(&self, instance: Arc<Instance>) {
        self.instances
            .insert(instance.id().to_string(), instance);
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    pub fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| e.value().clone()).collect()
    }

    pub fn remove_instance(&self, instance_id: &str) -> Option<Arc<Instance>> {
        self.instances.remove(instance_id).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InstanceState;
    use crate::runtime::PassthroughHooks;
    use std::time::Duration;

    fn linear_model() -> Arc<ProcessModel> {
        let text = serde_json::json!({
            "id": "bare-flow",
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
        .to_string();
        Arc::new(ProcessModel::parse(&text).expect("model parses"))
    }

    #[tokio::test]
    async fn bare_runtime_executes_behind_passthrough_hooks() {
        let process = DeployedProcess::new(
            "bare-flow",
            1,
            linear_model(),
            MachineSummary {
                id: "m-test".to_string(),
                ip: "127.0.0.1".to_string(),
                name: None,
            },
            Arc::new(PassthroughHooks),
        );
        let instance = process
            .start_instance(
                "bare-flow#1".to_string(),
                HashMap::new(),
                StartPosition::Default,
                None,
            )
            .await
            .expect("instance starts");
        for _ in 0..200 {
            if instance.instance_state().await == vec![InstanceState::Ended] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snapshot = instance.snapshot().await;
        assert_eq!(snapshot.instance_state, vec![InstanceState::Ended]);
        assert_eq!(snapshot.tokens.len(), 1);
        assert_eq!(snapshot.tokens[0].state, TokenState::Ended);
        assert!(snapshot.log.iter().any(|e| e.flow_element_id == "work"));
    }
}
