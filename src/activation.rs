//! Flow node activation. Runs when a token is about to execute its current
//! node and decides whether the runtime may go ahead, parking tokens that
//! wait on users, called instances, or external systems.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{Engine, InstanceEventHandlers};
use crate::integrations::{self, FIFTH_INDUSTRY_IMPLEMENTATION};
use crate::model::{
    now_millis, FlowNodeKind, Progress, Token, UserTaskRecord, UserTaskState,
};
use crate::runtime::Instance;

pub struct ActivationGate {
    engine: Weak<Engine>,
}

impl ActivationGate {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        ActivationGate { engine }
    }

    /// `true` lets the runtime execute the node right away; `false` parks the
    /// token until something else (a user, a child instance, an external
    /// system) moves it on.
    pub async fn should_activate_flow_node(
        &self,
        instance: &Arc<Instance>,
        token_id: &str,
        node_id: &str,
    ) -> Result<bool> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(false);
        };
        let model = instance.model().await;
        let node = model
            .node(node_id)
            .ok_or_else(|| anyhow!("unknown flow node {node_id}"))?;

        if node.placeholder {
            info!(
                instance_id = %instance.id(),
                node_id, "placeholder reached, token parks until a migration fills it in"
            );
            return Ok(false);
        }
        if node.external {
            instance
                .update_token(token_id, |t| {
                    t.current_flow_node_is_external = true;
                    t.current_flow_node_progress = Some(Progress::default());
                })
                .await?;
            return Ok(false);
        }

        match &node.kind {
            FlowNodeKind::UserTask {
                implementation,
                file_name,
            } => {
                let now = now_millis();
                let (priority, planned_end) = model.user_task_defaults(node, now);
                instance
                    .update_token(token_id, |t| {
                        t.current_flow_node_progress = Some(Progress::default());
                        t.milestones = node.milestones.iter().map(|m| (m.id.clone(), 0)).collect();
                        t.priority = Some(priority);
                    })
                    .await?;
                let record = UserTaskRecord {
                    id: node.id.clone(),
                    file_name: file_name.clone(),
                    implementation: implementation.clone(),
                    instance_id: instance.id().to_string(),
                    definition_id: instance.definition_id().to_string(),
                    definition_version: instance.version().await,
                    token_id: token_id.to_string(),
                    state: UserTaskState::Ready,
                    priority,
                    start_time: now,
                    end_time: planned_end,
                    attrs: node.attrs.clone(),
                };
                let fifth_industry = implementation
                    .as_deref()
                    .is_some_and(|i| i == FIFTH_INDUSTRY_IMPLEMENTATION);
                if fifth_industry {
                    if let Some(service) = engine.ctx().fifth_industry.clone() {
                        let timing = engine.ctx().config.fifth_industry.clone();
                        integrations::spawn_user_task_flow(
                            self.engine.clone(),
                            service,
                            instance.clone(),
                            record,
                            timing
                                .as_ref()
                                .map(|c| Duration::from_millis(c.activation_retry_ms))
                                .unwrap_or(Duration::from_secs(5)),
                            timing
                                .as_ref()
                                .map(|c| Duration::from_millis(c.poll_interval_ms))
                                .unwrap_or(Duration::from_secs(10)),
                        );
                        return Ok(false);
                    }
                    warn!(
                        instance_id = %instance.id(),
                        node_id, "user task wants 5thIndustry but no connection is configured"
                    );
                }
                engine.register_user_task(record).await;
                Ok(false)
            }
            FlowNodeKind::CallActivity => {
                self.start_called_instance(&engine, instance, token_id, node_id)
                    .await
            }
            FlowNodeKind::ScriptTask => {
                instance
                    .update_token(token_id, |t| {
                        t.current_flow_node_progress = Some(Progress::default());
                    })
                    .await?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    async fn start_called_instance(
        &self,
        engine: &Arc<Engine>,
        instance: &Arc<Instance>,
        token_id: &str,
        node_id: &str,
    ) -> Result<bool> {
        let model = instance.model().await;
        let import = model
            .import_for(node_id)
            .ok_or_else(|| anyhow!("call activity {node_id} has no imported process"))?
            .clone();
        let management = engine
            .management()
            .ok_or_else(|| anyhow!("management layer is gone"))?;

        let parent = Arc::downgrade(instance);
        let parent_token = token_id.to_string();
        let activity_id = node_id.to_string();
        let handlers = InstanceEventHandlers {
            on_ended: Some(Box::new(move |snapshot| {
                let Some(parent) = parent.upgrade() else {
                    return;
                };
                let variables = snapshot.variable_values();
                let _ = parent.complete_activity(
                    &parent_token,
                    Some(variables),
                    Some(activity_id.clone()),
                );
            })),
            ..Default::default()
        };

        let variables = instance.variables().await;
        let child = management
            .create_instance(
                &import.definition_id,
                import.version,
                variables,
                None,
                handlers,
                Some(instance.id().to_string()),
            )
            .await?;
        match child {
            Some(child_id) => {
                instance
                    .update_token(token_id, |t: &mut Token| {
                        t.called_instance = Some(child_id.clone());
                    })
                    .await?;
                info!(
                    instance_id = %instance.id(),
                    node_id, called_instance = %child_id, "called instance started"
                );
                Ok(true)
            }
            None => {
                warn!(
                    instance_id = %instance.id(),
                    node_id,
                    definition_id = %import.definition_id,
                    "this machine declined the called instance, token parks"
                );
                Ok(false)
            }
        }
    }
}
