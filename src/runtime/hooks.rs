use async_trait::async_trait;
use std::sync::Arc;

use super::instance::Instance;
use crate::model::{InstanceState, Token};

/// Seam between the mechanical token stepping and the engine layer. The
/// runtime moves tokens and keeps the instance record; deployment routing,
/// activation gating and archiving all happen behind these hooks.
#[async_trait]
pub trait ExecutionHooks: Send + Sync {
    /// Gate before a token crosses the sequence flow `from -> to`. Returning
    /// false means the hook took over the token (forwarded, paused or ended
    /// it); the runtime leaves it alone apart from finalizing terminal
    /// states.
    async fn should_pass_token(
        &self,
        _instance: &Arc<Instance>,
        _from: &str,
        _to: &str,
        _token_id: &str,
    ) -> bool {
        true
    }

    /// Gate when a token arrives at a flow node. Returning false parks the
    /// token READY at the node until `begin_activity` is called for it.
    async fn should_activate_flow_node(
        &self,
        _instance: &Arc<Instance>,
        _token_id: &str,
        _node_id: &str,
    ) -> bool {
        true
    }

    async fn on_started(&self, _instance: &Arc<Instance>) {}

    /// All tokens reached a terminal state and none of them is
    /// ERROR-INTERRUPTED; the instance is done on this machine.
    async fn on_ended(&self, _instance: &Arc<Instance>) {}

    async fn on_token_ended(&self, _instance: &Arc<Instance>, _token: &Token) {}

    /// A flow node finished executing; `token` is the state right after
    /// completion, before transient metadata is cleared.
    async fn on_flow_node_executed(&self, _instance: &Arc<Instance>, _token: &Token) {}

    /// A token parked on a user task left the happy path (paused, stopped,
    /// aborted or errored).
    async fn on_user_task_interrupted(&self, _instance: &Arc<Instance>, _token: &Token) {}

    /// Same for a token waiting on a call activity with a running child
    /// instance.
    async fn on_call_activity_interrupted(&self, _instance: &Arc<Instance>, _token: &Token) {}

    async fn on_instance_state_change(
        &self,
        _instance: &Arc<Instance>,
        _state: &[InstanceState],
    ) {
    }
}

/// Hook set that lets everything through, for driving the runtime bare.
pub struct PassthroughHooks;

#[async_trait]
impl ExecutionHooks for PassthroughHooks {}
