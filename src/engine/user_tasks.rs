//! User task surface of the engine: the task list, activation, completion,
//! and state reports for flow nodes executed outside the engine.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

use super::Engine;
use crate::error::EngineError;
use crate::model::{ExecutionState, Progress, TokenState, UserTaskRecord, UserTaskState};

/// Patch applied to an open user task through the management API.
#[derive(Debug, Clone, Default)]
pub struct UserTaskUpdate {
    pub intermediate_variables: Option<HashMap<String, Value>>,
    pub milestones: Option<HashMap<String, u32>>,
    /// Explicit progress percentage. Pins the value against automatic
    /// milestone averaging and the forced 100 on completion.
    pub progress: Option<u32>,
    pub priority: Option<u32>,
    pub performers: Option<Vec<Value>>,
}

impl Engine {
    /// Puts a task on the list. A leftover open record for the same token is
    /// replaced, which happens when a migration re-enters a user task node.
    pub async fn register_user_task(&self, record: UserTaskRecord) {
        info!(
            instance_id = %record.instance_id,
            user_task_id = %record.id,
            state = ?record.state,
            "user task registered"
        );
        let mut tasks = self.user_tasks.write().await;
        tasks.retain(|r| {
            !(r.instance_id == record.instance_id
                && r.token_id == record.token_id
                && r.state.is_open())
        });
        tasks.push(record);
    }

    async fn open_task(
        &self,
        instance_id: &str,
        user_task_id: &str,
    ) -> Result<UserTaskRecord, EngineError> {
        let tasks = self.user_tasks.read().await;
        tasks
            .iter()
            .find(|r| r.instance_id == instance_id && r.id == user_task_id && r.state.is_open())
            .cloned()
            .ok_or_else(|| {
                EngineError::UnknownUserTask(instance_id.to_string(), user_task_id.to_string())
            })
    }

    /// A user opened the task; its token starts running.
    pub async fn activate_user_task(&self, instance_id: &str, user_task_id: &str) -> Result<()> {
        let token_id = {
            let mut tasks = self.user_tasks.write().await;
            let record = tasks
                .iter_mut()
                .find(|r| {
                    r.instance_id == instance_id
                        && r.id == user_task_id
                        && r.state == UserTaskState::Ready
                })
                .ok_or_else(|| {
                    EngineError::UnknownUserTask(instance_id.to_string(), user_task_id.to_string())
                })?;
            record.state = UserTaskState::Active;
            record.token_id.clone()
        };
        let instance = self.live_instance(instance_id)?;
        instance.begin_activity(&token_id)
    }

    /// Completes the task. Intermediate variable state accumulated while the
    /// task was open commits together with `variables`.
    pub async fn complete_user_task(
        &self,
        instance_id: &str,
        user_task_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        let record = self.open_task(instance_id, user_task_id).await?;
        let instance = self.live_instance(instance_id)?;
        let mut merged = instance
            .token(&record.token_id)
            .await
            .and_then(|t| t.intermediate_variables_state)
            .unwrap_or_default();
        merged.extend(variables);
        instance.complete_activity(&record.token_id, Some(merged), Some(user_task_id.to_string()))
    }

    pub async fn abort_user_task(&self, instance_id: &str, user_task_id: &str) -> Result<()> {
        let record = self.open_task(instance_id, user_task_id).await?;
        let instance = self.live_instance(instance_id)?;
        instance
            .log_execution(user_task_id, &record.token_id, ExecutionState::Aborted, None)
            .await;
        instance
            .end_token(&record.token_id, Some(TokenState::Aborted), None)
            .await
    }

    /// Mid-task metadata updates from task UIs: intermediate variables,
    /// milestones, progress, priority, performers.
    pub async fn update_user_task(
        &self,
        instance_id: &str,
        user_task_id: &str,
        update: UserTaskUpdate,
    ) -> Result<()> {
        let record = self.open_task(instance_id, user_task_id).await?;
        let instance = self.live_instance(instance_id)?;
        let priority_update = update.priority;
        instance
            .update_token(&record.token_id, |t| {
                if let Some(variables) = update.intermediate_variables {
                    t.intermediate_variables_state
                        .get_or_insert_with(HashMap::new)
                        .extend(variables);
                }
                if let Some(milestones) = update.milestones {
                    t.milestones.extend(milestones);
                    // Milestone completion averages into the node progress
                    // unless someone pinned it.
                    let manual = t
                        .current_flow_node_progress
                        .map(|p| p.manual)
                        .unwrap_or(false);
                    if !manual && !t.milestones.is_empty() {
                        let sum: u32 = t.milestones.values().sum();
                        t.current_flow_node_progress = Some(Progress {
                            value: sum / t.milestones.len() as u32,
                            manual: false,
                        });
                    }
                }
                if let Some(value) = update.progress {
                    t.current_flow_node_progress = Some(Progress {
                        value,
                        manual: true,
                    });
                }
                if let Some(priority) = update.priority {
                    t.priority = Some(priority);
                }
                if let Some(performers) = update.performers {
                    t.performers = performers;
                }
            })
            .await?;
        if let Some(priority) = priority_update {
            let mut tasks = self.user_tasks.write().await;
            if let Some(record) = tasks.iter_mut().find(|r| {
                r.instance_id == instance_id && r.id == user_task_id && r.state.is_open()
            }) {
                record.priority = priority;
            }
        }
        Ok(())
    }

    /// State report for a flow node executed outside the engine. COMPLETED
    /// moves the token on; FAILED and TERMINATED end it.
    pub async fn set_flow_node_state(
        &self,
        instance_id: &str,
        node_id: &str,
        state: &str,
        variables: HashMap<String, Value>,
    ) -> Result<()> {
        let instance = self.live_instance(instance_id)?;
        let tokens = instance.tokens().await;
        let token = Self::tokens_at_node(&tokens, node_id).ok_or_else(|| {
            EngineError::NoTokenAtFlowNode(instance_id.to_string(), node_id.to_string())
        })?;
        if !token.current_flow_node_is_external {
            return Err(anyhow!("flow node {node_id} is not executed externally"));
        }
        match state {
            "COMPLETED" => instance.complete_activity(
                &token.token_id,
                Some(variables),
                Some(node_id.to_string()),
            ),
            "FAILED" => {
                instance
                    .log_execution(node_id, &token.token_id, ExecutionState::Failed, None)
                    .await;
                instance
                    .end_token(&token.token_id, Some(TokenState::Failed), None)
                    .await
            }
            "TERMINATED" => {
                instance
                    .log_execution(node_id, &token.token_id, ExecutionState::Terminated, None)
                    .await;
                instance
                    .end_token(&token.token_id, Some(TokenState::Terminated), None)
                    .await
            }
            other => Err(anyhow!("external flow nodes cannot take state {other}")),
        }
    }
}
