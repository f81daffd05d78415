use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::machine::{MachineSummary, NextMachine};

/// Milliseconds since the unix epoch. All instance timestamps use this scale.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Splits a `definitionId#version` process id. The definition id itself may
/// contain `#`, so the split happens at the last one.
pub fn split_process_id(process_id: &str) -> Option<(&str, u64)> {
    let (definition_id, version) = process_id.rsplit_once('#')?;
    let version = version.parse().ok()?;
    Some((definition_id, version))
}

pub fn join_process_id(definition_id: &str, version: u64) -> String {
    format!("{definition_id}#{version}")
}

/// Id of the n-th parallel sub-token forked from `parent`.
pub fn forked_token_id(parent: &str, n: usize) -> String {
    format!("{parent}|{n}")
}

/// Id of the n-th token spawned inside a subprocess whose container token is
/// `container`.
pub fn subprocess_token_id(container: &str, n: usize) -> String {
    format!("{container}#{n}")
}

/// Inverse of [`forked_token_id`]: the id the merged token continues under.
pub fn merged_token_id(forked: &str) -> Option<&str> {
    forked.rsplit_once('|').map(|(parent, _)| parent)
}

/// Container token id for a subprocess child token, if the id marks one.
pub fn subprocess_container_id(child: &str) -> Option<&str> {
    child.rsplit_once('#').map(|(container, _)| container)
}

/// Lifecycle state of a single token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenState {
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "DEPLOYMENT-WAITING")]
    DeploymentWaiting,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "FORWARDED")]
    Forwarded,
    #[serde(rename = "ENDED")]
    Ended,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "TERMINATED")]
    Terminated,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ERROR-CONSTRAINT-UNFULFILLED")]
    ErrorConstraintUnfulfilled,
    #[serde(rename = "ERROR-INTERRUPTED")]
    ErrorInterrupted,
}

impl TokenState {
    /// True if the token will never move again on this machine. FORWARDED
    /// counts: the token lives on elsewhere but is done here.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TokenState::Forwarded
                | TokenState::Ended
                | TokenState::Aborted
                | TokenState::Stopped
                | TokenState::Terminated
                | TokenState::Failed
                | TokenState::ErrorConstraintUnfulfilled
                | TokenState::ErrorInterrupted
        )
    }

    /// States a stop or abort still has to tear down.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            TokenState::Ready
                | TokenState::Running
                | TokenState::DeploymentWaiting
                | TokenState::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenState::Ready => "READY",
            TokenState::Running => "RUNNING",
            TokenState::DeploymentWaiting => "DEPLOYMENT-WAITING",
            TokenState::Paused => "PAUSED",
            TokenState::Forwarded => "FORWARDED",
            TokenState::Ended => "ENDED",
            TokenState::Aborted => "ABORTED",
            TokenState::Stopped => "STOPPED",
            TokenState::Terminated => "TERMINATED",
            TokenState::Failed => "FAILED",
            TokenState::ErrorConstraintUnfulfilled => "ERROR-CONSTRAINT-UNFULFILLED",
            TokenState::ErrorInterrupted => "ERROR-INTERRUPTED",
        }
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated instance state. Mostly the deduplicated token states in token
/// order; PAUSING is instance-only and leads the list while a pause request
/// is draining running activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PAUSING")]
    Pausing,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "FORWARDED")]
    Forwarded,
    #[serde(rename = "ENDED")]
    Ended,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "TERMINATED")]
    Terminated,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ERROR-CONSTRAINT-UNFULFILLED")]
    ErrorConstraintUnfulfilled,
    #[serde(rename = "ERROR-INTERRUPTED")]
    ErrorInterrupted,
}

impl From<TokenState> for InstanceState {
    fn from(state: TokenState) -> Self {
        match state {
            TokenState::Ready | TokenState::Running | TokenState::DeploymentWaiting => {
                InstanceState::Running
            }
            TokenState::Paused => InstanceState::Paused,
            TokenState::Forwarded => InstanceState::Forwarded,
            TokenState::Ended => InstanceState::Ended,
            TokenState::Aborted => InstanceState::Aborted,
            TokenState::Stopped => InstanceState::Stopped,
            TokenState::Terminated => InstanceState::Terminated,
            TokenState::Failed => InstanceState::Failed,
            TokenState::ErrorConstraintUnfulfilled => InstanceState::ErrorConstraintUnfulfilled,
            TokenState::ErrorInterrupted => InstanceState::ErrorInterrupted,
        }
    }
}

/// Derives the aggregated state list from the current tokens: one entry per
/// distinct mapped state, in first-appearance order.
pub fn derive_instance_state(tokens: &[Token], pausing: bool) -> Vec<InstanceState> {
    let mut states = Vec::new();
    // A fully terminal token set is past pausing; completion wins that race.
    let live = tokens.iter().any(|t| !t.state.is_terminal());
    if pausing && live {
        states.push(InstanceState::Pausing);
    }
    for token in tokens {
        let mapped = InstanceState::from(token.state);
        if !states.contains(&mapped) {
            states.push(mapped);
        }
    }
    states
}

/// Flow node progress in percent. `manual` pins the value against the
/// automatic milestone average and the forced 100 on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub value: u32,
    pub manual: bool,
}

/// A token wandering through the flow nodes of one instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Token {
    pub token_id: String,
    pub state: TokenState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow_element_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_flow_element_id: Option<String>,
    /// When the token started running on this machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_start_time: Option<i64>,
    /// Accumulated active execution time on this machine in milliseconds.
    pub local_execution_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow_element_start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub machine_hops: u32,
    pub decider_storage_rounds: u32,
    /// Milliseconds spent waiting between decider re-evaluations.
    pub decider_storage_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_machine: Option<NextMachine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_variables_state: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_flow_node_progress: Option<Progress>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub milestones: HashMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub performers: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub called_instance: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub current_flow_node_is_external: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flow_element_execution_was_interrupted: bool,
    /// Wire-only: node the token left when it was forwarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Wire-only: node the token is heading to on the receiving machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl Default for TokenState {
    fn default() -> Self {
        TokenState::Ready
    }
}

impl Token {
    /// A token freshly placed at `node_id`, ready to enter it.
    pub fn fresh(token_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Token {
            token_id: token_id.into(),
            state: TokenState::Ready,
            current_flow_element_id: Some(node_id.into()),
            local_start_time: Some(now_millis()),
            ..Token::default()
        }
    }

    pub fn current_node(&self) -> &str {
        self.current_flow_element_id.as_deref().unwrap_or("")
    }
}

/// Execution outcome recorded in the instance log for one flow node visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "TERMINATED")]
    Terminated,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ERROR-CONSTRAINT-UNFULFILLED")]
    ErrorConstraintUnfulfilled,
    #[serde(rename = "ERROR-INTERRUPTED")]
    ErrorInterrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub flow_element_id: String,
    pub token_id: String,
    pub execution_state: ExecutionState,
    pub start_time: i64,
    pub end_time: i64,
    /// Machine the node executed on.
    pub machine: MachineSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_machine: Option<NextMachine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub milestones: HashMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performers: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_instance: Option<String>,
}

/// One process variable with its full change history.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VariableEntry {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<VariableChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableChange {
    pub changed_time: i64,
    /// Flow node id that wrote the value.
    pub changed_by: String,
}

/// Structural change applied to a live instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AdaptationEntry {
    #[serde(rename = "MIGRATION")]
    #[serde(rename_all = "camelCase")]
    Migration {
        time: i64,
        source_version: u64,
        target_version: u64,
    },
}

/// Complete serializable view of an instance. This is both the archive format
/// and the payload body moved between machines when a token is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    /// `definitionId#version` of the deployed model the instance runs on.
    pub process_id: String,
    pub process_instance_id: String,
    pub global_start_time: i64,
    pub instance_state: Vec<InstanceState>,
    pub tokens: Vec<Token>,
    #[serde(default)]
    pub variables: HashMap<String, VariableEntry>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adaptation_log: Vec<AdaptationEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calling_instance: Option<String>,
}

impl InstanceSnapshot {
    /// Variables flattened to plain values, history stripped.
    pub fn variable_values(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }
}

/// Lifecycle of a user task record kept next to the token that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserTaskState {
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ERROR-INTERRUPTED")]
    ErrorInterrupted,
}

impl UserTaskState {
    pub fn is_open(self) -> bool {
        matches!(self, UserTaskState::Ready | UserTaskState::Active)
    }
}

impl From<TokenState> for UserTaskState {
    fn from(state: TokenState) -> Self {
        match state {
            TokenState::Paused => UserTaskState::Paused,
            TokenState::Aborted => UserTaskState::Aborted,
            TokenState::Failed => UserTaskState::Failed,
            TokenState::ErrorInterrupted => UserTaskState::ErrorInterrupted,
            _ => UserTaskState::Stopped,
        }
    }
}

/// In-memory record of a user task surfaced to task lists and HMIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTaskRecord {
    /// Flow node id of the user task.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    pub instance_id: String,
    pub definition_id: String,
    pub definition_version: u64,
    pub token_id: String,
    pub state: UserTaskState,
    pub priority: u32,
    pub start_time: i64,
    /// Planned end, when the model gives one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attrs: HashMap<String, Value>,
}

/// Reference to an instance inside archived user task records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedUserTask {
    pub process_instance: InstanceRef,
    pub definition_id: String,
    pub definition_version: u64,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub token_id: String,
    pub state: UserTaskState,
    pub priority: u32,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl ArchivedUserTask {
    pub fn from_record(record: &UserTaskRecord) -> Self {
        ArchivedUserTask {
            process_instance: InstanceRef {
                id: record.instance_id.clone(),
            },
            definition_id: record.definition_id.clone(),
            definition_version: record.definition_version,
            id: record.id.clone(),
            file_name: record.file_name.clone(),
            token_id: record.token_id.clone(),
            state: record.state,
            priority: record.priority,
            start_time: record.start_time,
            end_time: record.end_time,
        }
    }
}

/// Archived form of an instance. `is_currently_executed_in_bpmn_engine` marks
/// intermediate saves of live instances and is what crash recovery scans for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedInstance {
    #[serde(flatten)]
    pub info: InstanceSnapshot,
    pub is_currently_executed_in_bpmn_engine: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_tasks: Vec<ArchivedUserTask>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_states_use_wire_names() {
        assert_eq!(
            serde_json::to_value(TokenState::DeploymentWaiting).unwrap(),
            json!("DEPLOYMENT-WAITING")
        );
        assert_eq!(
            serde_json::to_value(TokenState::ErrorConstraintUnfulfilled).unwrap(),
            json!("ERROR-CONSTRAINT-UNFULFILLED")
        );
        let parsed: TokenState = serde_json::from_value(json!("ERROR-INTERRUPTED")).unwrap();
        assert_eq!(parsed, TokenState::ErrorInterrupted);
    }

    #[test]
    fn process_id_splits_at_last_hash() {
        assert_eq!(split_process_id("order#handling#17"), Some(("order#handling", 17)));
        assert_eq!(split_process_id("plain#3"), Some(("plain", 3)));
        assert_eq!(split_process_id("no-version"), None);
        assert_eq!(join_process_id("plain", 3), "plain#3");
    }

    #[test]
    fn token_lineage_helpers() {
        assert_eq!(forked_token_id("t1", 2), "t1|2");
        assert_eq!(merged_token_id("t1|2"), Some("t1"));
        assert_eq!(subprocess_token_id("t1", 1), "t1#1");
        assert_eq!(subprocess_container_id("t1#1"), Some("t1"));
        assert_eq!(merged_token_id("t1"), None);
    }

    #[test]
    fn instance_state_derivation_orders_and_dedupes() {
        let mk = |id: &str, state: TokenState| {
            let mut t = Token::fresh(id, "n");
            t.state = state;
            t
        };
        let tokens = vec![
            mk("a", TokenState::Running),
            mk("b", TokenState::Ready),
            mk("c", TokenState::Failed),
        ];
        assert_eq!(
            derive_instance_state(&tokens, false),
            vec![InstanceState::Running, InstanceState::Failed]
        );
        assert_eq!(
            derive_instance_state(&tokens, true)[0],
            InstanceState::Pausing
        );
        let finished = vec![mk("a", TokenState::Ended), mk("b", TokenState::Failed)];
        assert_eq!(
            derive_instance_state(&finished, true),
            vec![InstanceState::Ended, InstanceState::Failed]
        );
    }

    #[test]
    fn token_serializes_camel_case_and_skips_empty() {
        let mut token = Token::fresh("t1", "task_1");
        token.machine_hops = 2;
        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["tokenId"], json!("t1"));
        assert_eq!(value["state"], json!("READY"));
        assert_eq!(value["currentFlowElementId"], json!("task_1"));
        assert_eq!(value["machineHops"], json!(2));
        assert!(value.get("nextMachine").is_none());
        assert!(value.get("errorMessage").is_none());
        assert!(value.get("flowElementExecutionWasInterrupted").is_none());
    }

    #[test]
    fn archive_flattens_snapshot_fields() {
        let snapshot = InstanceSnapshot {
            process_id: "p#1".into(),
            process_instance_id: "i1".into(),
            global_start_time: 1,
            instance_state: vec![InstanceState::Running],
            tokens: vec![Token::fresh("t1", "n1")],
            variables: HashMap::new(),
            log: Vec::new(),
            adaptation_log: Vec::new(),
            calling_instance: None,
        };
        let archived = ArchivedInstance {
            info: snapshot,
            is_currently_executed_in_bpmn_engine: true,
            user_tasks: Vec::new(),
        };
        let value = serde_json::to_value(&archived).unwrap();
        assert_eq!(value["processId"], json!("p#1"));
        assert_eq!(value["isCurrentlyExecutedInBpmnEngine"], json!(true));
        let back: ArchivedInstance = serde_json::from_value(value).unwrap();
        assert_eq!(back.info.process_instance_id, "i1");
    }
}
