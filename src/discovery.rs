use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::model::Machine;

/// Where the engine learns who it is and which peers exist. Deployments in
/// the wild plug an mDNS or registry client in here; the default is the
/// static list from the config file.
#[async_trait]
pub trait MachineDiscovery: Send + Sync {
    async fn self_machine(&self) -> Machine;

    async fn online_machines(&self) -> Vec<Machine>;

    async fn machine_by_id(&self, id: &str) -> Option<Machine> {
        self.online_machines()
            .await
            .into_iter()
            .find(|m| m.id == id)
    }
}

pub struct StaticDiscovery {
    own: Machine,
    known: Vec<Machine>,
}

impl StaticDiscovery {
    pub fn from_config(config: &EngineConfig) -> Self {
        StaticDiscovery {
            own: config.own_machine(),
            known: config.known_machines.clone(),
        }
    }

    pub fn new(own: Machine, known: Vec<Machine>) -> Self {
        StaticDiscovery { own, known }
    }
}

#[async_trait]
impl MachineDiscovery for StaticDiscovery {
    async fn self_machine(&self) -> Machine {
        self.own.clone()
    }

    async fn online_machines(&self) -> Vec<Machine> {
        self.known.clone()
    }
}
