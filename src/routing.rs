//! Deployment routing. Decides, per sequence-flow crossing, whether the next
//! flow node runs on this engine or the token gets forwarded to a peer.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::decider::{AbortCheck, NextFlowNode, ProcessInfo, StopScope, TokenInfo};
use crate::engine::Engine;
use crate::model::{
    now_millis, parse_machine_address, DeploymentMethod, FlowNode, Machine, NextMachine,
    ProcessModel, TokenState,
};
use crate::runtime::Instance;

/// Message attached to tokens and instances that were stopped over
/// deployment constraints.
pub const TOKEN_STOPPED_MESSAGE: &str = "Token stopped execution";

enum StaticTarget {
    Local,
    Forward(Machine),
    Refused,
}

/// The should-pass gate. Holds the engine weakly; routing outlives nothing.
pub struct TokenRouter {
    engine: Weak<Engine>,
}

impl TokenRouter {
    pub(crate) fn new(engine: Weak<Engine>) -> Self {
        TokenRouter { engine }
    }

    /// Decides whether `token_id` may cross from `from` to `to` locally.
    /// `false` means the token was taken care of here: paused, forwarded to
    /// another machine, or ended over an unfulfillable constraint.
    pub async fn should_pass_token(
        &self,
        instance: &Arc<Instance>,
        from: &str,
        to: &str,
        token_id: &str,
    ) -> Result<bool> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(false);
        };
        if instance.is_pausing().await {
            instance.pause_token(token_id).await?;
            return Ok(false);
        }
        instance
            .update_token(token_id, |t| t.state = TokenState::DeploymentWaiting)
            .await?;
        let model = instance.model().await;
        let Some(method) = model.deployment_method else {
            return Ok(true);
        };
        let Some(node) = model.node(to) else {
            // Unknown target; entering it fails the token with a better
            // error than routing could give.
            return Ok(true);
        };
        match method {
            DeploymentMethod::Static => {
                self.route_static(&engine, instance, node, from, to, token_id)
                    .await
            }
            DeploymentMethod::Dynamic => {
                self.route_dynamic(&engine, instance, &model, node, from, to, token_id)
                    .await
            }
        }
    }

    // --- static deployment ---

    async fn route_static(
        &self,
        engine: &Arc<Engine>,
        instance: &Arc<Instance>,
        node: &FlowNode,
        from: &str,
        to: &str,
        token_id: &str,
    ) -> Result<bool> {
        let target = self.resolve_static_target(engine, node).await?;
        match target {
            StaticTarget::Local => Ok(true),
            StaticTarget::Refused => {
                instance
                    .end_token(
                        token_id,
                        Some(TokenState::ErrorConstraintUnfulfilled),
                        Some(TOKEN_STOPPED_MESSAGE.to_string()),
                    )
                    .await?;
                Ok(false)
            }
            StaticTarget::Forward(machine) => {
                match self
                    .forward_token(engine, instance, token_id, from, to, &machine, false)
                    .await
                {
                    Ok(()) => Ok(false),
                    Err(error) => {
                        warn!(
                            instance_id = %instance.id(),
                            token_id,
                            machine_id = %machine.id,
                            error = %error,
                            "static forwarding failed"
                        );
                        instance
                            .end_token(
                                token_id,
                                Some(TokenState::ErrorConstraintUnfulfilled),
                                Some(TOKEN_STOPPED_MESSAGE.to_string()),
                            )
                            .await?;
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn resolve_static_target(
        &self,
        engine: &Arc<Engine>,
        node: &FlowNode,
    ) -> Result<StaticTarget> {
        let own = engine.machine_information().await;
        let execution_deactivated = engine
            .ctx()
            .config
            .processes
            .deactivate_process_execution;
        if let Some(machine_id) = &node.machine_id {
            if *machine_id == own.id {
                if execution_deactivated {
                    warn!(node_id = %node.id, "node is bound to this machine but execution is deactivated");
                    return Ok(StaticTarget::Refused);
                }
                return Ok(StaticTarget::Local);
            }
            return match engine.ctx().discovery.machine_by_id(machine_id).await {
                Some(machine) => Ok(StaticTarget::Forward(machine)),
                None => {
                    warn!(node_id = %node.id, machine_id = %machine_id, "bound machine is not known");
                    Ok(StaticTarget::Refused)
                }
            };
        }
        if let Some(address) = &node.machine_address {
            let Some((ip, port)) = parse_machine_address(address) else {
                warn!(node_id = %node.id, address = %address, "unparseable machine address");
                return Ok(StaticTarget::Refused);
            };
            if ip == own.ip && port == own.port {
                if execution_deactivated {
                    return Ok(StaticTarget::Refused);
                }
                return Ok(StaticTarget::Local);
            }
            // The address alone does not identify the peer; ask it.
            let probe = match engine.forwarder().get_machine_info(&ip, port).await {
                Ok(probe) => probe,
                Err(error) => {
                    warn!(node_id = %node.id, address = %address, error = %error, "machine probe failed");
                    return Ok(StaticTarget::Refused);
                }
            };
            if probe.id == own.id {
                if execution_deactivated {
                    return Ok(StaticTarget::Refused);
                }
                return Ok(StaticTarget::Local);
            }
            return Ok(StaticTarget::Forward(Machine {
                id: probe.id,
                name: probe.name,
                hostname: probe.hostname,
                ip,
                port,
                properties: Default::default(),
            }));
        }
        // Unbound nodes of a statically deployed process run wherever the
        // token already is.
        Ok(StaticTarget::Local)
    }

    // --- dynamic deployment ---

    #[allow(clippy::too_many_arguments)]
    async fn route_dynamic(
        &self,
        engine: &Arc<Engine>,
        instance: &Arc<Instance>,
        model: &Arc<ProcessModel>,
        node: &FlowNode,
        from: &str,
        to: &str,
        token_id: &str,
    ) -> Result<bool> {
        let ctx = engine.ctx();
        let decider = ctx.decider.clone();
        let process_info = ProcessInfo {
            id: instance.process_id().await,
            next_flow_node: NextFlowNode {
                id: to.to_string(),
                is_user_task: node.is_user_task(),
            },
        };
        let previous_constraints = model
            .node(from)
            .map(|n| n.constraints.hard_constraints.clone())
            .unwrap_or_default();
        let process_hard = model.constraints.hard_constraints.clone();

        let token_info = self.token_info(instance, token_id).await?;
        let pre_check = decider
            .pre_check_abort(&process_info, &token_info, &previous_constraints, &process_hard)
            .await?;
        if pre_check.aborting() {
            self.handle_abort(engine, instance, token_id, &pre_check)
                .await?;
            return Ok(false);
        }

        let re_evaluate_after = Duration::from_millis(ctx.config.router.re_evaluate_timer_ms);
        let max_rounds = ctx.config.router.max_re_evaluation_rounds;
        let mut rounds: u32 = 0;
        loop {
            let token_info = self.token_info(instance, token_id).await?;
            let result = decider
                .find_optimal_next_machine(
                    &process_info,
                    &token_info,
                    &node.constraints,
                    &model.constraints,
                )
                .await?;
            if result.abort_check.aborting() {
                self.handle_abort(engine, instance, token_id, &result.abort_check)
                    .await?;
                return Ok(false);
            }
            for candidate in &result.engine_list {
                if candidate.is_local() {
                    return Ok(true);
                }
                let Some(machine) = candidate.to_machine() else {
                    continue;
                };
                match self
                    .forward_token(engine, instance, token_id, from, to, &machine, true)
                    .await
                {
                    Ok(()) => return Ok(false),
                    Err(error) => {
                        debug!(
                            instance_id = %instance.id(),
                            token_id,
                            machine_id = %machine.id,
                            error = %error,
                            "candidate rejected the token, trying the next one"
                        );
                    }
                }
            }

            rounds += 1;
            if let Some(max) = max_rounds {
                if rounds >= max {
                    warn!(
                        instance_id = %instance.id(),
                        token_id, rounds, "no machine took the token, giving up"
                    );
                    instance
                        .end_token(
                            token_id,
                            Some(TokenState::ErrorConstraintUnfulfilled),
                            Some(TOKEN_STOPPED_MESSAGE.to_string()),
                        )
                        .await?;
                    return Ok(false);
                }
            }
            debug!(
                instance_id = %instance.id(),
                token_id, rounds, "no machine available, token keeps waiting"
            );
            tokio::time::sleep(re_evaluate_after).await;

            // The world may have moved on while we slept.
            match instance.token(token_id).await {
                Some(t) if t.state == TokenState::DeploymentWaiting => {}
                _ => return Ok(false),
            }
            if instance.is_pausing().await {
                instance.pause_token(token_id).await?;
                return Ok(false);
            }
            instance
                .update_token(token_id, |t| {
                    t.decider_storage_rounds += 1;
                    t.decider_storage_time += re_evaluate_after.as_millis() as i64;
                })
                .await?;
        }
    }

    async fn token_info(&self, instance: &Arc<Instance>, token_id: &str) -> Result<TokenInfo> {
        let token = instance
            .token(token_id)
            .await
            .ok_or_else(|| anyhow!("instance {} has no token {token_id}", instance.id()))?;
        Ok(TokenInfo {
            global_start_time: instance.global_start_time().await,
            local_start_time: token.local_start_time,
            local_execution_time: token.local_execution_time,
            machine_hops: token.machine_hops,
            decider_storage_rounds: token.decider_storage_rounds,
            decider_storage_time: token.decider_storage_time,
            flow_element_elapsed_ms: token
                .current_flow_element_start_time
                .map(|start| now_millis() - start),
        })
    }

    async fn handle_abort(
        &self,
        engine: &Arc<Engine>,
        instance: &Arc<Instance>,
        token_id: &str,
        abort: &AbortCheck,
    ) -> Result<()> {
        let reasons = abort.unfulfilled_constraints.join(", ");
        let message = format!("{TOKEN_STOPPED_MESSAGE} because of: {reasons}");
        match abort.stop_process {
            Some(StopScope::Instance) => {
                info!(instance_id = %instance.id(), reasons = %reasons, "stopping instance over execution constraints");
                engine
                    .stop_unfulfilled_instance(instance.id(), Some(message))
                    .await?;
            }
            Some(StopScope::Token) => {
                info!(instance_id = %instance.id(), token_id, reasons = %reasons, "stopping token over execution constraints");
                instance
                    .end_token(
                        token_id,
                        Some(TokenState::ErrorConstraintUnfulfilled),
                        Some(message),
                    )
                    .await?;
            }
            None => {}
        }
        Ok(())
    }

    // --- forwarding ---

    /// Ships the token (and with `with_process` the process files first) to
    /// `target`. The token is marked FORWARDED before anything leaves this
    /// machine; a failed send reverts it to DEPLOYMENT-WAITING.
    #[allow(clippy::too_many_arguments)]
    async fn forward_token(
        &self,
        engine: &Arc<Engine>,
        instance: &Arc<Instance>,
        token_id: &str,
        from: &str,
        to: &str,
        target: &Machine,
        with_process: bool,
    ) -> Result<()> {
        let next_machine = NextMachine {
            id: target.id.clone(),
            ip: target.ip.clone(),
            port: target.port,
            name: target.display_name(),
        };
        instance
            .update_token(token_id, |t| {
                t.state = TokenState::Forwarded;
                t.end_time = Some(now_millis());
                t.next_machine = Some(next_machine.clone());
            })
            .await?;
        instance
            .update_log(from, token_id, |entry| {
                entry.next_machine = Some(next_machine.clone());
            })
            .await;

        let definition_id = instance.definition_id().to_string();
        let version = instance.version().await;
        let send = async {
            if with_process {
                engine
                    .forwarder()
                    .forward_process(target, &definition_id, version)
                    .await?;
            }
            let mut payload = instance.snapshot().await;
            let mut token = instance
                .token(token_id)
                .await
                .ok_or_else(|| anyhow!("token {token_id} vanished while forwarding"))?;
            token.from = Some(from.to_string());
            token.to = Some(to.to_string());
            payload.tokens = vec![token];
            engine
                .forwarder()
                .forward_instance(target, &definition_id, &payload)
                .await
        };
        match send.await {
            Ok(()) => {
                info!(
                    instance_id = %instance.id(),
                    token_id,
                    machine_id = %target.id,
                    address = %format!("{}:{}", target.ip, target.port),
                    "token forwarded"
                );
                Ok(())
            }
            Err(error) => {
                instance
                    .update_token(token_id, |t| {
                        t.state = TokenState::DeploymentWaiting;
                        t.end_time = None;
                        t.next_machine = None;
                    })
                    .await?;
                instance
                    .update_log(from, token_id, |entry| entry.next_machine = None)
                    .await;
                Err(error)
            }
        }
    }
}
