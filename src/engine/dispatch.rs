//! Hook wiring between the token runtime and the engine: routing and
//! activation gates, log stamping, user task bookkeeping, archival.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

use super::Engine;
use crate::activation::ActivationGate;
use crate::model::{
    now_millis, InstanceSnapshot, InstanceState, Progress, Token, TokenState, UserTaskState,
};
use crate::routing::TokenRouter;
use crate::runtime::{ExecutionHooks, Instance};

pub type StartedHandler = Box<dyn Fn(&Arc<Instance>) + Send + Sync>;
pub type EndedHandler = Box<dyn Fn(&InstanceSnapshot) + Send + Sync>;
pub type TokenEndedHandler = Box<dyn Fn(&Token) + Send + Sync>;

/// Per-instance callbacks registered by whoever starts the instance.
#[derive(Default)]
pub struct InstanceEventHandlers {
    pub on_started: Option<StartedHandler>,
    pub on_ended: Option<EndedHandler>,
    pub on_token_ended: Option<TokenEndedHandler>,
}

pub(crate) struct HookDispatch {
    engine: Weak<Engine>,
    router: TokenRouter,
    gate: ActivationGate,
}

impl HookDispatch {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        HookDispatch {
            engine: engine.clone(),
            router: TokenRouter::new(engine.clone()),
            gate: ActivationGate::new(engine),
        }
    }

    /// A gate that errors takes the token down instead of letting it run in
    /// an undecided state.
    async fn fail_token(instance: &Arc<Instance>, token_id: &str, error: anyhow::Error) {
        error!(
            instance_id = %instance.id(),
            token_id, error = %error, "gate failed, ending token"
        );
        let _ = instance
            .end_token(token_id, Some(TokenState::Failed), Some(error.to_string()))
            .await;
    }
}

#[async_trait]
impl ExecutionHooks for HookDispatch {
    async fn should_pass_token(
        &self,
        instance: &Arc<Instance>,
        from: &str,
        to: &str,
        token_id: &str,
    ) -> bool {
        match self
            .router
            .should_pass_token(instance, from, to, token_id)
            .await
        {
            Ok(pass) => pass,
            Err(error) => {
                Self::fail_token(instance, token_id, error).await;
                false
            }
        }
    }

    async fn should_activate_flow_node(
        &self,
        instance: &Arc<Instance>,
        token_id: &str,
        node_id: &str,
    ) -> bool {
        match self
            .gate
            .should_activate_flow_node(instance, token_id, node_id)
            .await
        {
            Ok(activate) => activate,
            Err(error) => {
                Self::fail_token(instance, token_id, error).await;
                false
            }
        }
    }

    async fn on_started(&self, instance: &Arc<Instance>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.attach_instance(instance);
        if let Some(handlers) = engine.handlers(instance.id()) {
            if let Some(on_started) = &handlers.on_started {
                on_started(instance);
            }
        }
    }

    async fn on_flow_node_executed(&self, instance: &Arc<Instance>, token: &Token) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let node_id = token.current_node().to_string();
        // Completion pins 100 percent unless someone set progress by hand.
        let progress = match token.current_flow_node_progress {
            Some(p) if p.manual => p,
            _ => Progress {
                value: 100,
                manual: false,
            },
        };
        instance
            .update_log(&node_id, &token.token_id, |entry| {
                entry.progress = Some(progress);
                entry.milestones = token.milestones.clone();
                entry.priority = token.priority;
                entry.performers = token.performers.clone();
                entry.external = token.current_flow_node_is_external;
                entry.called_instance = token.called_instance.clone();
            })
            .await;
        // The per-node metadata lived on the token only while the node ran.
        let _ = instance
            .update_token(&token.token_id, |t| {
                t.intermediate_variables_state = None;
                t.current_flow_node_progress = None;
                t.milestones.clear();
                t.priority = None;
                t.performers.clear();
                t.current_flow_node_is_external = false;
                t.called_instance = None;
            })
            .await;
        engine
            .close_user_task_record(instance.id(), &token.token_id)
            .await;
    }

    async fn on_token_ended(&self, instance: &Arc<Instance>, token: &Token) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Some(handlers) = engine.handlers(instance.id()) {
            if let Some(on_token_ended) = &handlers.on_token_ended {
                on_token_ended(token);
            }
        }
    }

    async fn on_user_task_interrupted(&self, instance: &Arc<Instance>, token: &Token) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.sync_user_task_state(instance.id(), token).await;
    }

    async fn on_call_activity_interrupted(&self, instance: &Arc<Instance>, token: &Token) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Some(child_id) = token.called_instance.clone() else {
            return;
        };
        let management = engine.management();
        let state = token.state;
        let parent_id = instance.id().to_string();
        // The child is torn down outside the parent's driver task.
        tokio::spawn(async move {
            let Some(management) = management else {
                return;
            };
            let result = match state {
                TokenState::Paused => management.pause_instance_by_id(&child_id).await.map(|_| ()),
                TokenState::Aborted => management.abort_instance_by_id(&child_id).await,
                _ => management.stop_instance_by_id(&child_id).await,
            };
            if let Err(error) = result {
                debug!(
                    instance_id = %parent_id,
                    called_instance = %child_id,
                    error = %error,
                    "called instance teardown failed"
                );
            }
        });
    }

    async fn on_instance_state_change(&self, instance: &Arc<Instance>, _state: &[InstanceState]) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if instance.is_externally_managed().await {
            // Stop, abort and pause write their own final archive.
            return;
        }
        let tokens = instance.tokens().await;
        let all_terminal = !tokens.is_empty() && tokens.iter().all(|t| t.state.is_terminal());
        let interrupted = tokens
            .iter()
            .any(|t| t.state == TokenState::ErrorInterrupted);
        if all_terminal && !interrupted {
            // The natural end writes the final archive in on_ended.
            return;
        }
        if let Err(error) = engine.save_intermediate(instance).await {
            error!(
                instance_id = %instance.id(),
                error = %error, "intermediate instance save failed"
            );
        }
    }

    async fn on_ended(&self, instance: &Arc<Instance>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        engine.finalize_instance(instance).await;
    }
}

impl Engine {
    /// Marks a just-finished user task record as completed.
    pub(crate) async fn close_user_task_record(&self, instance_id: &str, token_id: &str) {
        let mut tasks = self.user_tasks.write().await;
        if let Some(record) = tasks
            .iter_mut()
            .find(|r| r.instance_id == instance_id && r.token_id == token_id && r.state.is_open())
        {
            record.state = UserTaskState::Completed;
            record.end_time = Some(now_millis());
        }
    }

    /// Mirrors an interrupted token's state onto its user task record.
    pub(crate) async fn sync_user_task_state(&self, instance_id: &str, token: &Token) {
        let mut tasks = self.user_tasks.write().await;
        if let Some(record) = tasks
            .iter_mut()
            .find(|r| r.instance_id == instance_id && r.token_id == token.token_id)
        {
            if record.state.is_open() || record.state == UserTaskState::Paused {
                record.state = token.state.into();
                if !record.state.is_open() && record.state != UserTaskState::Paused {
                    record.end_time = Some(now_millis());
                }
            }
        }
    }
}
