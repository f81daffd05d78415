use anyhow::Result;
use async_trait::async_trait;
use evalexpr::{
    build_operator_tree, ContextWithMutableVariables, DefaultNumericTypes, HashMapContext,
    Value as EvalValue,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::discovery::MachineDiscovery;
use crate::model::{now_millis, Constraint, ConstraintSet, Machine};

/// Sentinel id meaning "execute on this machine, do not forward".
pub const LOCAL_ENGINE: &str = "local-engine";

/// Token-level execution constraints, checked against token bookkeeping
/// rather than machine properties. Time values are in seconds.
const EXECUTION_CONSTRAINTS: [&str; 5] = [
    "maxMachineHops",
    "maxTokenStorageRounds",
    "maxTokenStorageTime",
    "maxTime",
    "maxTimeGlobal",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEngine {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl CandidateEngine {
    pub fn local() -> Self {
        CandidateEngine {
            id: LOCAL_ENGINE.to_string(),
            ip: None,
            port: None,
            name: None,
            hostname: None,
        }
    }

    pub fn from_machine(machine: &Machine) -> Self {
        CandidateEngine {
            id: machine.id.clone(),
            ip: Some(machine.ip.clone()),
            port: Some(machine.port),
            name: machine.name.clone(),
            hostname: machine.hostname.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_ENGINE
    }

    /// Full machine record, when the candidate is addressable.
    pub fn to_machine(&self) -> Option<Machine> {
        Some(Machine {
            id: self.id.clone(),
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            ip: self.ip.clone()?,
            port: self.port?,
            properties: Default::default(),
        })
    }
}

/// Whether a violated constraint ends just the token or the whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopScope {
    Token,
    Instance,
}

#[derive(Debug, Clone, Default)]
pub struct AbortCheck {
    pub stop_process: Option<StopScope>,
    pub unfulfilled_constraints: Vec<String>,
}

impl AbortCheck {
    pub fn aborting(&self) -> bool {
        self.stop_process.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MachineResult {
    pub engine_list: Vec<CandidateEngine>,
    /// True when the list is ordered best-first.
    pub prioritized: bool,
    pub abort_check: AbortCheck,
}

#[derive(Debug, Clone)]
pub struct NextFlowNode {
    pub id: String,
    pub is_user_task: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: String,
    pub next_flow_node: NextFlowNode,
}

/// Decider-facing view of a token.
#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    pub global_start_time: i64,
    pub local_start_time: Option<i64>,
    pub local_execution_time: i64,
    pub machine_hops: u32,
    pub decider_storage_rounds: u32,
    pub decider_storage_time: i64,
    /// How long the previously executed flow node actually ran, for maxTime.
    pub flow_element_elapsed_ms: Option<i64>,
}

/// Chooses where a token executes next. The built-in implementation works on
/// the deployed constraints; richer deployments swap in a remote decider.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn find_optimal_next_machine(
        &self,
        process: &ProcessInfo,
        token: &TokenInfo,
        flow_node_constraints: &ConstraintSet,
        process_constraints: &ConstraintSet,
    ) -> Result<MachineResult>;

    /// Early constraint check against the node the token just left and the
    /// process-wide constraints, before any machine search.
    async fn pre_check_abort(
        &self,
        process: &ProcessInfo,
        token: &TokenInfo,
        previous_node_constraints: &[Constraint],
        process_constraints: &[Constraint],
    ) -> Result<AbortCheck>;

    /// Whether a fresh or incoming token may run on this machine at all.
    async fn allowed_to_execute_locally(
        &self,
        process: &ProcessInfo,
        token: &TokenInfo,
        flow_node_constraints: &ConstraintSet,
        process_constraints: &ConstraintSet,
    ) -> Result<bool>;
}

/// Constraint evaluation against machine properties and token bookkeeping.
pub struct ConstraintDecider {
    discovery: Arc<dyn MachineDiscovery>,
}

impl ConstraintDecider {
    pub fn new(discovery: Arc<dyn MachineDiscovery>) -> Self {
        ConstraintDecider { discovery }
    }

    fn is_execution_constraint(constraint: &Constraint) -> bool {
        EXECUTION_CONSTRAINTS.contains(&constraint.name.as_str())
    }

    fn compare(lhs: f64, op: &str, rhs: f64) -> bool {
        match op {
            "<" => lhs < rhs,
            "<=" => lhs <= rhs,
            ">" => lhs > rhs,
            ">=" => lhs >= rhs,
            "==" | "=" => (lhs - rhs).abs() < f64::EPSILON,
            "!=" => (lhs - rhs).abs() >= f64::EPSILON,
            other => {
                warn!("unknown constraint operator {other}, treating as fulfilled");
                true
            }
        }
    }

    /// Names of the execution constraints the token currently violates.
    fn execution_violations(token: &TokenInfo, constraints: &[Constraint]) -> Vec<String> {
        let now = now_millis();
        let mut violated = Vec::new();
        for constraint in constraints {
            if !Self::is_execution_constraint(constraint) {
                continue;
            }
            let lhs = match constraint.name.as_str() {
                "maxMachineHops" => token.machine_hops as f64,
                "maxTokenStorageRounds" => token.decider_storage_rounds as f64,
                "maxTokenStorageTime" => token.decider_storage_time as f64 / 1000.0,
                "maxTime" => match token.flow_element_elapsed_ms {
                    Some(ms) => ms as f64 / 1000.0,
                    None => token.local_execution_time as f64 / 1000.0,
                },
                "maxTimeGlobal" => (now - token.global_start_time) as f64 / 1000.0,
                _ => continue,
            };
            let op = constraint.condition.as_deref().unwrap_or("<=");
            let Some(rhs) = constraint.first_value().and_then(Value::as_f64) else {
                continue;
            };
            if !Self::compare(lhs, op, rhs) {
                violated.push(constraint.name.clone());
            }
        }
        violated
    }

    /// Identifiers in constraint names may contain dots; evalexpr variable
    /// names may not, so both sides are flattened the same way.
    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }

    fn json_to_eval(value: &Value) -> EvalValue<DefaultNumericTypes> {
        match value {
            Value::Bool(b) => EvalValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    EvalValue::Int(i)
                } else {
                    EvalValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => EvalValue::String(s.clone()),
            _ => EvalValue::Empty,
        }
    }

    fn machine_context(machine: &Machine) -> Result<HashMapContext<DefaultNumericTypes>> {
        let mut context = HashMapContext::<DefaultNumericTypes>::new();
        context.set_value(
            "machine_id".to_string(),
            EvalValue::String(machine.id.clone()),
        )?;
        if let Some(name) = machine.display_name() {
            context.set_value("machine_name".to_string(), EvalValue::String(name))?;
        }
        for (key, value) in &machine.properties {
            context.set_value(Self::sanitize(key), Self::json_to_eval(value))?;
        }
        Ok(context)
    }

    fn meets(machine: &Machine, constraint: &Constraint) -> bool {
        let Ok(context) = Self::machine_context(machine) else {
            return false;
        };
        let op = constraint.condition.as_deref().unwrap_or("==");
        // Any listed value may satisfy the constraint.
        constraint.values.iter().any(|v| {
            let literal = serde_json::to_string(&v.value).unwrap_or_default();
            let expr = format!("{} {} {}", Self::sanitize(&constraint.name), op, literal);
            match build_operator_tree::<DefaultNumericTypes>(&expr) {
                Ok(tree) => tree.eval_boolean_with_context(&context).unwrap_or(false),
                Err(e) => {
                    warn!(constraint = %constraint.name, "unparseable constraint: {e}");
                    false
                }
            }
        })
    }

    fn satisfies_all(machine: &Machine, constraints: &[&Constraint]) -> bool {
        constraints.iter().all(|c| Self::meets(machine, c))
    }

    fn soft_score(machine: &Machine, constraints: &[&Constraint]) -> usize {
        constraints
            .iter()
            .filter(|c| Self::meets(machine, c))
            .count()
    }
}

#[async_trait]
impl Decider for ConstraintDecider {
    async fn find_optimal_next_machine(
        &self,
        _process: &ProcessInfo,
        token: &TokenInfo,
        flow_node_constraints: &ConstraintSet,
        process_constraints: &ConstraintSet,
    ) -> Result<MachineResult> {
        // Execution constraints first: a token over its limits aborts instead
        // of hopping further.
        let node_violations =
            Self::execution_violations(token, &flow_node_constraints.hard_constraints);
        if !node_violations.is_empty() {
            return Ok(MachineResult {
                abort_check: AbortCheck {
                    stop_process: Some(StopScope::Token),
                    unfulfilled_constraints: node_violations,
                },
                ..Default::default()
            });
        }
        let process_violations =
            Self::execution_violations(token, &process_constraints.hard_constraints);
        if !process_violations.is_empty() {
            return Ok(MachineResult {
                abort_check: AbortCheck {
                    stop_process: Some(StopScope::Instance),
                    unfulfilled_constraints: process_violations,
                },
                ..Default::default()
            });
        }

        let hard: Vec<&Constraint> = flow_node_constraints
            .hard_constraints
            .iter()
            .chain(process_constraints.hard_constraints.iter())
            .filter(|c| !Self::is_execution_constraint(c))
            .collect();
        let soft: Vec<&Constraint> = flow_node_constraints
            .soft_constraints
            .iter()
            .chain(process_constraints.soft_constraints.iter())
            .filter(|c| !Self::is_execution_constraint(c))
            .collect();

        let own = self.discovery.self_machine().await;
        let mut candidates = Vec::new();
        if Self::satisfies_all(&own, &hard) {
            candidates.push((Self::soft_score(&own, &soft), CandidateEngine::local()));
        }
        for machine in self.discovery.online_machines().await {
            if machine.id == own.id {
                continue;
            }
            if Self::satisfies_all(&machine, &hard) {
                candidates.push((
                    Self::soft_score(&machine, &soft),
                    CandidateEngine::from_machine(&machine),
                ));
            }
        }
        let prioritized = !soft.is_empty() && candidates.len() > 1;
        if prioritized {
            candidates.sort_by(|a, b| b.0.cmp(&a.0));
        }
        Ok(MachineResult {
            engine_list: candidates.into_iter().map(|(_, c)| c).collect(),
            prioritized,
            abort_check: AbortCheck::default(),
        })
    }

    async fn pre_check_abort(
        &self,
        _process: &ProcessInfo,
        token: &TokenInfo,
        previous_node_constraints: &[Constraint],
        process_constraints: &[Constraint],
    ) -> Result<AbortCheck> {
        let node_violations = Self::execution_violations(token, previous_node_constraints);
        if !node_violations.is_empty() {
            return Ok(AbortCheck {
                stop_process: Some(StopScope::Token),
                unfulfilled_constraints: node_violations,
            });
        }
        let process_violations = Self::execution_violations(token, process_constraints);
        if !process_violations.is_empty() {
            return Ok(AbortCheck {
                stop_process: Some(StopScope::Instance),
                unfulfilled_constraints: process_violations,
            });
        }
        Ok(AbortCheck::default())
    }

    async fn allowed_to_execute_locally(
        &self,
        process: &ProcessInfo,
        token: &TokenInfo,
        flow_node_constraints: &ConstraintSet,
        process_constraints: &ConstraintSet,
    ) -> Result<bool> {
        let pre = self
            .pre_check_abort(
                process,
                token,
                &flow_node_constraints.hard_constraints,
                &process_constraints.hard_constraints,
            )
            .await?;
        if pre.aborting() {
            return Ok(false);
        }
        let hard: Vec<&Constraint> = flow_node_constraints
            .hard_constraints
            .iter()
            .chain(process_constraints.hard_constraints.iter())
            .filter(|c| !Self::is_execution_constraint(c))
            .collect();
        let own = self.discovery.self_machine().await;
        Ok(Self::satisfies_all(&own, &hard))
    }
}
