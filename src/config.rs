use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use crate::model::Machine;

/// Engine configuration, normally loaded from a YAML file. Every field has a
/// default so a bare `EngineConfig::default()` yields a working local setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub machine: MachineConfig,
    pub processes: ProcessesConfig,
    pub router: RouterConfig,
    /// Statically known peers, used when no richer discovery is wired in.
    pub known_machines: Vec<Machine>,
    /// When set, process deployments and archives go to redis instead of the
    /// in-memory store.
    pub redis_url: Option<String>,
    pub fifth_industry: Option<FifthIndustryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Stable machine id. Generated per run when absent.
    pub id: Option<String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub ip: String,
    pub port: u16,
    /// Advertised machine properties, matched by expression constraints.
    pub properties: HashMap<String, Value>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            id: None,
            name: None,
            hostname: None,
            ip: "127.0.0.1".to_string(),
            port: 33029,
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessesConfig {
    /// Kill switch: this machine accepts no new instances or tokens.
    pub deactivate_process_execution: bool,
}

impl Default for ProcessesConfig {
    fn default() -> Self {
        ProcessesConfig {
            deactivate_process_execution: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Wait between decider re-evaluations when no machine takes a token.
    pub re_evaluate_timer_ms: u64,
    /// Upper bound on re-evaluation rounds. `None` keeps a stuck token
    /// waiting indefinitely.
    pub max_re_evaluation_rounds: Option<u32>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            re_evaluate_timer_ms: 30_000,
            max_re_evaluation_rounds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FifthIndustryConfig {
    pub api_url: String,
    pub app_url: Option<String>,
    pub auth_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Retry cadence while waiting for an inspection plan to become usable.
    pub activation_retry_ms: u64,
    /// Poll cadence while waiting for an inspection plan to complete.
    pub poll_interval_ms: u64,
}

impl Default for FifthIndustryConfig {
    fn default() -> Self {
        FifthIndustryConfig {
            api_url: String::new(),
            app_url: None,
            auth_url: None,
            client_id: None,
            client_secret: None,
            activation_retry_ms: 5_000,
            poll_interval_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Resolves the full identity of this machine. Call once and keep the
    /// result; a missing id is replaced by a fresh uuid each call.
    pub fn own_machine(&self) -> Machine {
        Machine {
            id: self
                .machine
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.machine.name.clone(),
            hostname: self.machine.hostname.clone(),
            ip: self.machine.ip.clone(),
            port: self.machine.port,
            properties: self.machine.properties.clone(),
        }
    }
}
