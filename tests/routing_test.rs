mod common;

use common::*;
use prozess::decider::{AbortCheck, StopScope};
use prozess::model::{ExecutionState, InstanceState, TokenState};
use std::collections::HashMap;

#[tokio::test]
async fn static_binding_forwards_the_instance() {
    let mut config = test_config("machine-1");
    config.known_machines = vec![peer("machine-2", "10.0.0.2", 33029)];
    let bed = test_bed(config);
    deploy(&bed, &static_model("bound-flow", "machine-2"), 1).await;

    let (handlers, mut ended) = ended_channel();
    let instance_id = bed
        .management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    // 1. The token left FORWARDED, bound for machine-2.
    assert_eq!(snapshot.instance_state, vec![InstanceState::Forwarded]);
    let token = &snapshot.tokens[0];
    assert_eq!(token.state, TokenState::Forwarded);
    let next = token.next_machine.as_ref().expect("No next machine");
    assert_eq!(next.id, "machine-2");
    assert!(token.end_time.is_some());
    let start_entry = snapshot
        .log
        .iter()
        .find(|e| e.flow_element_id == "start")
        .expect("No log entry for the start event");
    assert_eq!(
        start_entry.next_machine.as_ref().map(|m| m.id.as_str()),
        Some("machine-2")
    );

    // 2. Static deployment ships the instance only; the peer already has the
    //    process.
    let requests = bed.network.sent();
    assert_eq!(requests.len(), 1, "expected exactly the instance transfer");
    let transfer = &requests[0];
    assert_eq!(transfer.ip, "10.0.0.2");
    assert_eq!(transfer.method, "PUT");
    assert_eq!(
        transfer.path,
        format!("process/bound-flow/instance/{instance_id}")
    );
    let body = transfer.body.as_ref().expect("Transfer has no body");
    let carried = &body["tokens"][0];
    assert_eq!(carried["from"], "start");
    assert_eq!(carried["to"], "work");
    assert_eq!(carried["state"], "FORWARDED");
    assert_eq!(carried["nextMachine"]["id"], "machine-2");
}

#[tokio::test]
async fn static_binding_to_self_runs_locally() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &static_model("bound-flow", "machine-1"), 1).await;

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(snapshot.instance_state, vec![InstanceState::Ended]);
    assert_eq!(snapshot.log.len(), 3);
    assert!(
        bed.network.sent().is_empty(),
        "a self-bound node should never touch the network"
    );
}

#[tokio::test]
async fn static_address_probe_detects_self() {
    let bed = test_bed(test_config("machine-1"));
    bed.network.answer_probe("10.0.0.9", 4444, "machine-1");
    deploy(&bed, &static_address_model("bound-flow", "10.0.0.9:4444"), 1).await;

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    // The probe answered with our own id, so the token never left.
    assert_eq!(snapshot.instance_state, vec![InstanceState::Ended]);
    let requests = bed.network.sent();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "machine/id,name,hostname");
    assert_eq!(requests[0].ip, "10.0.0.9");
    assert_eq!(requests[0].port, 4444);
}

#[tokio::test]
async fn static_address_probe_forwards_to_the_answering_machine() {
    let bed = test_bed(test_config("machine-1"));
    bed.network.answer_probe("10.0.0.9", 4444, "machine-9");
    deploy(&bed, &static_address_model("bound-flow", "10.0.0.9:4444"), 1).await;

    let (handlers, mut ended) = ended_channel();
    let instance_id = bed
        .management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(snapshot.instance_state, vec![InstanceState::Forwarded]);
    assert_eq!(
        snapshot.tokens[0]
            .next_machine
            .as_ref()
            .map(|m| m.id.as_str()),
        Some("machine-9")
    );
    let transfers = bed.network.sent_to_path("instance/");
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].ip, "10.0.0.9");
    assert_eq!(transfers[0].port, 4444);
    assert_eq!(
        transfers[0].path,
        format!("process/bound-flow/instance/{instance_id}")
    );
}

#[tokio::test]
async fn static_unknown_machine_stops_the_token() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &static_model("bound-flow", "machine-9"), 1).await;

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(
        snapshot.instance_state,
        vec![InstanceState::ErrorConstraintUnfulfilled]
    );
    let token = &snapshot.tokens[0];
    assert_eq!(token.state, TokenState::ErrorConstraintUnfulfilled);
    assert_eq!(token.error_message.as_deref(), Some("Token stopped execution"));
    assert!(bed.network.sent().is_empty());
}

#[tokio::test]
async fn dynamic_routing_stays_local_on_the_sentinel() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;

    // The decider answers 'local-engine' for every crossing.
    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("roaming-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(snapshot.instance_state, vec![InstanceState::Ended]);
    assert!(bed.network.sent().is_empty());
}

#[tokio::test]
async fn dynamic_routing_forwards_process_then_instance() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.decider
        .push_candidates(vec![remote_candidate("machine-2", "10.0.0.2", 33029)]);

    let (handlers, mut ended) = ended_channel();
    let instance_id = bed
        .management
        .create_instance("roaming-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(snapshot.instance_state, vec![InstanceState::Forwarded]);
    assert_eq!(snapshot.tokens[0].state, TokenState::Forwarded);

    // Dynamic deployment cannot assume the peer knows the process: the model
    // goes over first, then the instance.
    let requests = bed.network.sent();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "process");
    assert!(requests[0]
        .body
        .as_ref()
        .and_then(|b| b["bpmn"].as_str())
        .is_some());
    assert_eq!(requests[1].method, "PUT");
    assert_eq!(
        requests[1].path,
        format!("process/roaming-flow/instance/{instance_id}")
    );
    let carried = &requests[1].body.as_ref().expect("No body")["tokens"][0];
    assert_eq!(carried["from"], "start");
    assert_eq!(carried["to"], "work");
    assert_eq!(carried["nextMachine"]["id"], "machine-2");
}

#[tokio::test]
async fn dynamic_routing_falls_back_to_the_next_candidate() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.network.fail_target("10.0.0.2", 33029);
    bed.decider.push_candidates(vec![
        remote_candidate("machine-2", "10.0.0.2", 33029),
        remote_candidate("machine-3", "10.0.0.3", 33029),
    ]);

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("roaming-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    // machine-2 was unreachable, machine-3 took the token.
    assert_eq!(snapshot.instance_state, vec![InstanceState::Forwarded]);
    assert_eq!(
        snapshot.tokens[0]
            .next_machine
            .as_ref()
            .map(|m| m.id.as_str()),
        Some("machine-3")
    );
    let start_entry = snapshot
        .log
        .iter()
        .find(|e| e.flow_element_id == "start")
        .expect("No log entry for the start event");
    assert_eq!(
        start_entry.next_machine.as_ref().map(|m| m.id.as_str()),
        Some("machine-3")
    );
    let transfers = bed.network.sent_to_path("instance/");
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].ip, "10.0.0.3");
}

#[tokio::test]
async fn dynamic_routing_gives_up_after_the_last_round() {
    let mut config = test_config("machine-1");
    config.router.max_re_evaluation_rounds = Some(1);
    let bed = test_bed(config);
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.network.fail_target("10.0.0.2", 33029);
    bed.decider
        .push_candidates(vec![remote_candidate("machine-2", "10.0.0.2", 33029)]);

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("roaming-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    assert_eq!(
        snapshot.instance_state,
        vec![InstanceState::ErrorConstraintUnfulfilled]
    );
    let token = &snapshot.tokens[0];
    assert_eq!(token.state, TokenState::ErrorConstraintUnfulfilled);
    assert_eq!(token.error_message.as_deref(), Some("Token stopped execution"));
    assert!(token.next_machine.is_none(), "failed forward was not reverted");
}

#[tokio::test]
async fn dynamic_abort_ends_the_token_with_the_reasons() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.decider.push_abort(AbortCheck {
        stop_process: Some(StopScope::Token),
        unfulfilled_constraints: vec!["maxTime".to_string(), "maxMachineHops".to_string()],
    });

    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("roaming-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;

    let token = &snapshot.tokens[0];
    assert_eq!(token.state, TokenState::ErrorConstraintUnfulfilled);
    assert_eq!(
        token.error_message.as_deref(),
        Some("Token stopped execution because of: maxTime, maxMachineHops")
    );
}

#[tokio::test]
async fn dynamic_abort_can_stop_the_whole_instance() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.decider.push_abort(AbortCheck {
        stop_process: Some(StopScope::Instance),
        unfulfilled_constraints: vec!["maxTimeGlobal".to_string()],
    });

    let instance_id = bed
        .management
        .create_instance(
            "roaming-flow",
            1,
            HashMap::new(),
            None,
            Default::default(),
            None,
        )
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");

    // Instance-scope aborts tear the whole instance down; no natural end
    // fires, so watch the archive instead.
    let engine = bed
        .management
        .get_engine_with_definition_id("roaming-flow")
        .expect("Engine disappeared");
    let info = wait_for_final_archive(&engine, &instance_id).await;
    assert_eq!(
        info.archive.info.instance_state,
        vec![InstanceState::ErrorConstraintUnfulfilled]
    );
    let token = &info.archive.info.tokens[0];
    assert_eq!(token.state, TokenState::ErrorConstraintUnfulfilled);
    assert_eq!(
        token.error_message.as_deref(),
        Some("Token stopped execution because of: maxTimeGlobal")
    );
    assert!(info
        .archive
        .info
        .log
        .iter()
        .any(|e| e.execution_state == ExecutionState::ErrorConstraintUnfulfilled));
}
