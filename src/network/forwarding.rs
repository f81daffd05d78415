use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::MachineNetwork;
use crate::model::{InstanceSnapshot, Machine, MachineProbe, ProcessModel};
use crate::storage::ProcessStorage;

/// Everything that leaves this machine for another engine: deployments,
/// forwarded instances and teardown broadcasts.
#[derive(Clone)]
pub struct Forwarder {
    network: Arc<dyn MachineNetwork>,
    storage: Arc<dyn ProcessStorage>,
}

impl Forwarder {
    pub fn new(network: Arc<dyn MachineNetwork>, storage: Arc<dyn ProcessStorage>) -> Self {
        Forwarder { network, storage }
    }

    /// Identity probe used to resolve statically addressed machines.
    pub async fn get_machine_info(&self, ip: &str, port: u16) -> Result<MachineProbe> {
        let answer = self
            .network
            .request(ip, port, "GET", "machine/id,name,hostname", None)
            .await?;
        Ok(serde_json::from_value(answer)?)
    }

    /// Ships a deployed process version to another machine: the model text,
    /// the html of its user tasks, and recursively every imported version.
    pub async fn forward_process(
        &self,
        target: &Machine,
        definition_id: &str,
        version: u64,
    ) -> Result<()> {
        let text = self
            .storage
            .get_process_version(definition_id, version)
            .await?
            .ok_or_else(|| anyhow!("process {definition_id} version {version} is not stored"))?;
        let model = ProcessModel::parse(&text)?;

        self.network
            .request(
                &target.ip,
                target.port,
                "POST",
                "process",
                Some(&json!({ "bpmn": text })),
            )
            .await?;

        for file in model.user_task_files() {
            if let Some(html) = self.storage.get_html(definition_id, &file).await? {
                self.network
                    .request(
                        &target.ip,
                        target.port,
                        "PUT",
                        &format!("process/{definition_id}/user-tasks/{file}"),
                        Some(&json!({ "html": html })),
                    )
                    .await?;
            }
        }

        for import in &model.imports {
            Box::pin(self.forward_process(target, &import.definition_id, import.version)).await?;
        }
        Ok(())
    }

    /// Hands an instance over to another machine. The payload carries exactly
    /// one token, annotated with the flow it is crossing.
    pub async fn forward_instance(
        &self,
        target: &Machine,
        definition_id: &str,
        payload: &InstanceSnapshot,
    ) -> Result<()> {
        self.network
            .request(
                &target.ip,
                target.port,
                "PUT",
                &format!(
                    "process/{definition_id}/instance/{}",
                    payload.process_instance_id
                ),
                Some(&serde_json::to_value(payload)?),
            )
            .await?;
        Ok(())
    }

    /// Tells every known machine that an instance was stopped or aborted, so
    /// distributed parts stop too. Unreachable machines and machines that
    /// never saw the instance are fine; all errors are swallowed.
    pub async fn broadcast_instance_state(
        &self,
        machines: &[Machine],
        definition_id: &str,
        instance_id: &str,
        state: &str,
    ) {
        for machine in machines {
            let outcome = self
                .network
                .request(
                    &machine.ip,
                    machine.port,
                    "PUT",
                    &format!("process/{definition_id}/instance/{instance_id}/instanceState"),
                    Some(&json!({ "instanceState": state })),
                )
                .await;
            if let Err(e) = outcome {
                debug!(
                    machine_id = %machine.id,
                    instance_id,
                    "machine did not take the {state} notice: {e:#}"
                );
            }
        }
    }
}
