use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::decider::{ConstraintDecider, Decider};
use crate::discovery::{MachineDiscovery, StaticDiscovery};
use crate::integrations::FifthIndustryService;
use crate::model::InstanceSnapshot;
use crate::network::{HttpNetwork, MachineNetwork};
use crate::storage::{InMemoryStorage, ProcessStorage};

/// Sink for instance state snapshots, fed on every state change and on
/// stop/pause/abort. Deployments hook messaging systems in here.
#[async_trait]
pub trait InstancePublisher: Send + Sync {
    async fn publish_instance_state(&self, definition_id: &str, snapshot: &InstanceSnapshot);

    /// Called when an instance leaves this machine for good.
    fn teardown(&self, _instance_id: &str) {}
}

pub struct NoopPublisher;

#[async_trait]
impl InstancePublisher for NoopPublisher {
    async fn publish_instance_state(&self, _definition_id: &str, _snapshot: &InstanceSnapshot) {}
}

/// Publisher that only traces, the default in local runs.
pub struct LogPublisher;

#[async_trait]
impl InstancePublisher for LogPublisher {
    async fn publish_instance_state(&self, definition_id: &str, snapshot: &InstanceSnapshot) {
        debug!(
            definition_id,
            instance_id = %snapshot.process_instance_id,
            state = ?snapshot.instance_state,
            "instance state"
        );
    }
}

/// Everything engines share: configuration and the pluggable backends. Built
/// once at startup and handed around as `Arc<EngineContext>`.
pub struct EngineContext {
    pub config: EngineConfig,
    pub storage: Arc<dyn ProcessStorage>,
    pub network: Arc<dyn MachineNetwork>,
    pub discovery: Arc<dyn MachineDiscovery>,
    pub decider: Arc<dyn Decider>,
    pub publisher: Arc<dyn InstancePublisher>,
    pub fifth_industry: Option<Arc<dyn FifthIndustryService>>,
}

impl EngineContext {
    /// Context with the default backends: in-memory storage, http transport,
    /// static discovery and the constraint decider.
    pub fn new(config: EngineConfig) -> Self {
        let discovery: Arc<dyn MachineDiscovery> =
            Arc::new(StaticDiscovery::from_config(&config));
        EngineContext {
            storage: Arc::new(InMemoryStorage::new()),
            network: Arc::new(HttpNetwork::new()),
            decider: Arc::new(ConstraintDecider::new(discovery.clone())),
            discovery,
            publisher: Arc::new(LogPublisher),
            fifth_industry: None,
            config,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ProcessStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_network(mut self, network: Arc<dyn MachineNetwork>) -> Self {
        self.network = network;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn MachineDiscovery>) -> Self {
        self.decider = Arc::new(ConstraintDecider::new(discovery.clone()));
        self.discovery = discovery;
        self
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn InstancePublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_fifth_industry(mut self, service: Arc<dyn FifthIndustryService>) -> Self {
        self.fifth_industry = Some(service);
        self
    }
}
