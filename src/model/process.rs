use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where instances of a process are allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMethod {
    /// Every flow node names its machine up front.
    Static,
    /// Machines are chosen at runtime by the decider.
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintValue {
    pub value: Value,
}

/// A single constraint. Expression constraints compare a machine property
/// (`name`) against `values` with the `condition` operator; the named
/// execution constraints (maxMachineHops, maxTokenStorageRounds,
/// maxTokenStorageTime, maxTime, maxTimeGlobal) are checked against token
/// bookkeeping instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ConstraintValue>,
}

impl Constraint {
    pub fn first_value(&self) -> Option<&Value> {
        self.values.first().map(|v| &v.value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConstraintSet {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hard_constraints: Vec<Constraint>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub soft_constraints: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn is_empty(&self) -> bool {
        self.hard_constraints.is_empty() && self.soft_constraints.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Flow node kinds the token runtime knows how to drive. The serialized tag
/// lives in the node's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowNodeKind {
    StartEvent,
    EndEvent,
    Task,
    ScriptTask,
    #[serde(rename_all = "camelCase")]
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        implementation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    CallActivity,
    ParallelGateway,
    SubProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: FlowNodeKind,
    /// Static deployment: machine bound by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Static deployment: machine bound by `ip:port` address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_address: Option<String>,
    /// Execution happens outside the engine; tokens park here until a state
    /// update arrives through the management layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    /// Unfinished model element. Tokens never activate it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
    /// After a crash, interrupted tokens here turn into ERROR-INTERRUPTED
    /// instead of being restarted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub manual_interruption_handling: bool,
    /// Containing subprocess node, for nested elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "ConstraintSet::is_empty")]
    pub constraints: ConstraintSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub milestones: Vec<Milestone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_planned_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_planned_duration_ms: Option<i64>,
    /// Vendor extension attributes, e.g. the `_5i-*` inspection plan binding.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attrs: HashMap<String, Value>,
}

impl FlowNode {
    pub fn is_user_task(&self) -> bool {
        matches!(self.kind, FlowNodeKind::UserTask { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
}

/// Binding of a call activity to the process version it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessImport {
    pub call_activity_id: String,
    pub definition_id: String,
    pub version: u64,
}

/// Executable process description. Stored and shipped between machines as its
/// JSON text; the parsed form backs all structural lookups during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_method: Option<DeploymentMethod>,
    #[serde(default, skip_serializing_if = "ConstraintSet::is_empty")]
    pub constraints: ConstraintSet,
    pub flow_nodes: Vec<FlowNode>,
    #[serde(default)]
    pub sequence_flows: Vec<SequenceFlow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ProcessImport>,
}

impl ProcessModel {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse process model")
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize process model")
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.flow_nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        self.sequence_flows
            .iter()
            .filter(|f| f.source_ref == node_id)
            .collect()
    }

    pub fn incoming_count(&self, node_id: &str) -> usize {
        self.sequence_flows
            .iter()
            .filter(|f| f.target_ref == node_id)
            .count()
    }

    /// Top-level start event, the default entry point of fresh instances.
    pub fn start_node(&self) -> Option<&FlowNode> {
        self.flow_nodes
            .iter()
            .find(|n| n.parent.is_none() && n.kind == FlowNodeKind::StartEvent)
    }

    /// Start event nested directly inside the given subprocess node.
    pub fn subprocess_start_node(&self, container_id: &str) -> Option<&FlowNode> {
        self.flow_nodes.iter().find(|n| {
            n.parent.as_deref() == Some(container_id) && n.kind == FlowNodeKind::StartEvent
        })
    }

    pub fn import_for(&self, call_activity_id: &str) -> Option<&ProcessImport> {
        self.imports
            .iter()
            .find(|i| i.call_activity_id == call_activity_id)
    }

    /// Walks the parent chain of a node, innermost container first.
    pub fn ancestors<'a>(&'a self, node_id: &str) -> Vec<&'a FlowNode> {
        let mut chain = Vec::new();
        let mut current = self.node(node_id).and_then(|n| n.parent.as_deref());
        while let Some(parent_id) = current {
            match self.node(parent_id) {
                Some(parent) => {
                    chain.push(parent);
                    current = parent.parent.as_deref();
                }
                None => break,
            }
        }
        chain
    }

    /// The node itself or its nearest ancestor carrying the manual
    /// interruption flag.
    pub fn manual_interruption_scope<'a>(&'a self, node_id: &str) -> Option<&'a FlowNode> {
        if let Some(node) = self.node(node_id) {
            if node.manual_interruption_handling {
                return Some(node);
            }
        }
        self.ancestors(node_id)
            .into_iter()
            .find(|n| n.manual_interruption_handling)
    }

    /// HTML files referenced by user tasks, needed for the deployment to be
    /// considered complete.
    pub fn user_task_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .flow_nodes
            .iter()
            .filter_map(|n| match &n.kind {
                FlowNodeKind::UserTask { file_name, .. } => file_name.clone(),
                _ => None,
            })
            .collect();
        files.sort();
        files.dedup();
        files
    }

    /// Flow node metadata carried by fresh user task records.
    pub fn user_task_defaults(&self, node: &FlowNode, now: i64) -> (u32, Option<i64>) {
        let priority = node.default_priority.unwrap_or(1);
        let planned_end = node
            .time_planned_end
            .or_else(|| node.time_planned_duration_ms.map(|d| now + d));
        (priority, planned_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> ProcessModel {
        ProcessModel::parse(
            &json!({
                "id": "demo",
                "deploymentMethod": "dynamic",
                "flowNodes": [
                    {"id": "start", "type": "startEvent"},
                    {"id": "task", "type": "userTask", "fileName": "form.html", "defaultPriority": 3},
                    {"id": "sub", "type": "subProcess", "manualInterruptionHandling": true},
                    {"id": "sub_start", "type": "startEvent", "parent": "sub"},
                    {"id": "sub_task", "type": "task", "parent": "sub"},
                    {"id": "end", "type": "endEvent"}
                ],
                "sequenceFlows": [
                    {"id": "f1", "sourceRef": "start", "targetRef": "task"},
                    {"id": "f2", "sourceRef": "task", "targetRef": "sub"},
                    {"id": "f3", "sourceRef": "sub_start", "targetRef": "sub_task"},
                    {"id": "f4", "sourceRef": "sub", "targetRef": "end"}
                ]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn parses_node_kinds_from_type_tag() {
        let m = model();
        assert!(matches!(
            m.node("task").unwrap().kind,
            FlowNodeKind::UserTask { .. }
        ));
        assert_eq!(m.node("sub").unwrap().kind, FlowNodeKind::SubProcess);
        assert_eq!(m.deployment_method, Some(DeploymentMethod::Dynamic));
    }

    #[test]
    fn structural_lookups() {
        let m = model();
        assert_eq!(m.start_node().unwrap().id, "start");
        assert_eq!(m.subprocess_start_node("sub").unwrap().id, "sub_start");
        assert_eq!(m.outgoing("task")[0].target_ref, "sub");
        assert_eq!(m.incoming_count("end"), 1);
        assert_eq!(m.user_task_files(), vec!["form.html".to_string()]);
    }

    #[test]
    fn manual_interruption_scope_walks_ancestors() {
        let m = model();
        assert_eq!(m.manual_interruption_scope("sub_task").unwrap().id, "sub");
        assert_eq!(m.manual_interruption_scope("sub").unwrap().id, "sub");
        assert!(m.manual_interruption_scope("task").is_none());
    }

    #[test]
    fn user_task_defaults_derive_planned_end() {
        let m = model();
        let node = m.node("task").unwrap();
        let (priority, planned) = m.user_task_defaults(node, 1_000);
        assert_eq!(priority, 3);
        assert_eq!(planned, None);

        let timed: FlowNode = serde_json::from_value(json!({
            "id": "t2", "type": "userTask", "timePlannedDurationMs": 500
        }))
        .unwrap();
        let (_, planned) = m.user_task_defaults(&timed, 1_000);
        assert_eq!(planned, Some(1_500));
    }
}
