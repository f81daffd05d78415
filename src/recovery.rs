//! Brings back instances a crashed engine left behind. The archive keeps an
//! `isCurrentlyExecutedInBpmnEngine` marker on every intermediate save; after
//! a restart, any archive still carrying the marker belongs to an instance
//! that never reached a proper end.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::management::{has_live_children, Management};
use crate::model::{
    derive_instance_state, now_millis, split_process_id, ArchivedInstance, FlowNodeKind,
    InstanceState, TokenState, UserTaskState,
};
use crate::runtime::InstanceSeed;

/// What happens to a called instance whose caller came back interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalledInstancePolicy {
    /// The called instance is parked paused until someone handles the
    /// caller's interruption and resumes it.
    #[default]
    PauseCalled,
    /// The called instance is interrupted as well and waits for manual
    /// handling of its own.
    ErrorCalled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryOptions {
    pub called_instance_policy: CalledInstancePolicy,
}

impl Management {
    /// Scans the archive for instances still marked as executing and
    /// restores them. Callers are restored before their called instances
    /// so interruption policies can reach the children. Returns the ids
    /// brought back to life.
    pub async fn restore_interrupted_instances(
        self: &Arc<Self>,
        options: &RecoveryOptions,
    ) -> Result<Vec<String>> {
        let mut visited = HashSet::new();
        let mut restored = Vec::new();
        for definition_id in self.ctx().storage.get_all_processes().await? {
            let archives = self
                .ctx()
                .storage
                .get_archived_instances(&definition_id)
                .await?;
            let mut interrupted: Vec<_> = archives
                .into_iter()
                .filter(|(_, archive)| archive.is_currently_executed_in_bpmn_engine)
                .map(|(instance_id, _)| instance_id)
                .collect();
            interrupted.sort();
            for instance_id in interrupted {
                self.restore_with_callers(&instance_id, options, &mut visited, &mut restored)
                    .await;
            }
        }
        Ok(restored)
    }

    /// Restores the caller chain above an instance first, then the instance
    /// itself. The visited set keeps shared callers from being restored
    /// twice and cuts caller cycles short.
    async fn restore_with_callers(
        self: &Arc<Self>,
        instance_id: &str,
        options: &RecoveryOptions,
        visited: &mut HashSet<String>,
        restored: &mut Vec<String>,
    ) {
        if !visited.insert(instance_id.to_string()) {
            return;
        }
        let found = match self.find_archived_instance(instance_id).await {
            Ok(found) => found,
            Err(error) => {
                warn!(instance_id, error = %error, "archive lookup failed during recovery");
                return;
            }
        };
        let Some((definition_id, archive)) = found else {
            return;
        };
        if !archive.is_currently_executed_in_bpmn_engine {
            return;
        }
        if let Some(caller_id) = archive.info.calling_instance.clone() {
            Box::pin(self.restore_with_callers(&caller_id, options, visited, restored)).await;
        }
        match self.restore_instance(&definition_id, archive, options).await {
            Ok(Some(id)) => restored.push(id),
            Ok(None) => {}
            Err(error) => {
                warn!(definition_id, instance_id, error = %error, "instance did not restore");
            }
        }
    }

    async fn find_archived_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<(String, ArchivedInstance)>> {
        for definition_id in self.ctx().storage.get_all_processes().await? {
            if let Some(archive) = self
                .ctx()
                .storage
                .get_archived_instance(&definition_id, instance_id)
                .await?
            {
                return Ok(Some((definition_id, archive)));
            }
        }
        Ok(None)
    }

    /// Restores one archived instance. Returns the instance id when it came
    /// back live, `None` when the archive only needed closing out.
    async fn restore_instance(
        self: &Arc<Self>,
        definition_id: &str,
        archive: ArchivedInstance,
        options: &RecoveryOptions,
    ) -> Result<Option<String>> {
        let instance_id = archive.info.process_instance_id.clone();
        match archive.info.instance_state.first() {
            Some(InstanceState::Ended) | Some(InstanceState::Terminated) => {
                // Finished right before the crash; only the marker is stale.
                let mut closed = archive;
                closed.is_currently_executed_in_bpmn_engine = false;
                self.ctx()
                    .storage
                    .archive_instance(definition_id, &instance_id, &closed)
                    .await?;
                return Ok(None);
            }
            _ => {}
        }

        let pausing = matches!(
            archive.info.instance_state.first(),
            Some(InstanceState::Pausing)
        );
        let (_, version) = split_process_id(&archive.info.process_id)
            .ok_or_else(|| anyhow!("malformed process id {}", archive.info.process_id))?;
        let engine = self
            .ensure_process_engine_with_version(definition_id, version)
            .await?;
        if engine.has_instance(&instance_id) {
            return Ok(Some(instance_id));
        }
        let model = engine
            .deployed_version(version)
            .ok_or_else(|| anyhow!("version {version} vanished after deployment"))?
            .model();

        let parked_by_caller = self.take_pause_on_restore(&instance_id);
        if parked_by_caller
            && options.called_instance_policy == CalledInstancePolicy::PauseCalled
        {
            self.park_called_paused(definition_id, archive).await?;
            return Ok(None);
        }
        // Under ErrorCalled the whole called instance is interrupted along
        // with its caller.
        let interrupt_all = parked_by_caller;
        let pausing = pausing && !interrupt_all;

        let archived_tokens = archive.info.tokens.clone();
        let mut tokens = archive.info.tokens.clone();
        for token in &mut tokens {
            if token.state.is_terminal() || token.state == TokenState::Paused {
                continue;
            }
            let node_id = token.current_node().to_string();
            let was_running = token.state == TokenState::Running;
            if interrupt_all
                || (was_running && model.manual_interruption_scope(&node_id).is_some())
            {
                token.state = TokenState::ErrorInterrupted;
                token.flow_element_execution_was_interrupted = true;
                token.end_time = Some(now_millis());
                if let Some(child) = &token.called_instance {
                    self.mark_pause_on_restore(child);
                }
                continue;
            }
            if token.state == TokenState::DeploymentWaiting {
                // Re-enters the routing loop when the seed schedules it.
                continue;
            }
            match model.node(&node_id).map(|n| &n.kind) {
                Some(FlowNodeKind::SubProcess)
                    if was_running && has_live_children(&archived_tokens, &token.token_id) =>
                {
                    // The container only follows its children.
                }
                Some(FlowNodeKind::CallActivity)
                    if was_running && token.called_instance.is_some() => {}
                _ => {
                    token.state = TokenState::Ready;
                    token.current_flow_element_start_time = None;
                    token.end_time = None;
                    if was_running {
                        token.flow_element_execution_was_interrupted = true;
                    }
                }
            }
        }

        let handlers = self.caller_completion_handlers(archive.info.calling_instance.as_deref());
        let seed = InstanceSeed {
            instance_id: instance_id.clone(),
            global_start_time: Some(archive.info.global_start_time),
            tokens,
            variables: archive.info.variables.clone(),
            log: archive.info.log.clone(),
            adaptation_log: archive.info.adaptation_log.clone(),
            calling_instance: archive.info.calling_instance.clone(),
            pausing,
        };
        let id = engine
            .start_process_version_with_state(version, seed, handlers)
            .await?;
        if pausing {
            // The crash cut a pause short; let it finish now.
            engine.pause_instance(&id).await?;
            info!(definition_id, instance_id = %id, "interrupted pause completed");
            return Ok(Some(id));
        }
        if let Ok(instance) = engine.live_instance(&id) {
            engine.save_intermediate(&instance).await?;
        }
        info!(definition_id, instance_id = %id, "interrupted instance restored");
        Ok(Some(id))
    }

    /// Writes a called instance back to the archive as paused instead of
    /// restoring it, because its caller sits interrupted.
    async fn park_called_paused(
        &self,
        definition_id: &str,
        mut archive: ArchivedInstance,
    ) -> Result<()> {
        let instance_id = archive.info.process_instance_id.clone();
        for token in &mut archive.info.tokens {
            if !token.state.is_terminal() {
                token.state = TokenState::Paused;
            }
        }
        for task in &mut archive.user_tasks {
            if task.state.is_open() {
                task.state = UserTaskState::Paused;
            }
        }
        archive.info.instance_state = derive_instance_state(&archive.info.tokens, false);
        archive.is_currently_executed_in_bpmn_engine = false;
        self.ctx()
            .storage
            .archive_instance(definition_id, &instance_id, &archive)
            .await?;
        info!(
            definition_id,
            instance_id = %instance_id,
            "called instance parked paused, its caller is interrupted"
        );
        Ok(())
    }
}
