mod common;

use common::*;
use prozess::model::{InstanceSnapshot, InstanceState, TokenState, UserTaskState};
use serde_json::json;
use std::collections::HashMap;

#[tokio::test]
async fn deactivated_execution_refuses_instances() {
    let mut config = test_config("machine-1");
    config.processes.deactivate_process_execution = true;
    let bed = test_bed(config);
    deploy(&bed, &linear_model("order-flow"), 1).await;

    let started = bed
        .management
        .create_instance(
            "order-flow",
            1,
            HashMap::new(),
            None,
            Default::default(),
            None,
        )
        .await
        .expect("Instance creation failed");
    assert!(started.is_none(), "the kill switch did not refuse the instance");
}

#[tokio::test]
async fn dynamic_start_constraints_can_refuse_the_instance() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &dynamic_model("roaming-flow"), 1).await;
    bed.decider.refuse_local_start();

    let started = bed
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
        .expect("Instance creation failed");
    assert!(started.is_none(), "the decider's refusal was ignored");
}

#[tokio::test]
async fn process_versions_deploy_once_per_engine() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &linear_model("order-flow"), 1).await;
    deploy(&bed, &linear_model("order-flow"), 2).await;

    let engine = bed
        .management
        .ensure_process_engine_with_version("order-flow", 1)
        .await
        .expect("Deployment failed");
    let again = bed
        .management
        .ensure_process_engine_with_version("order-flow", 1)
        .await
        .expect("Second deployment failed");
    assert!(
        std::sync::Arc::ptr_eq(&engine, &again),
        "definition got a second engine"
    );

    let first = engine
        .deploy_process_version(1)
        .await
        .expect("Redeploy failed");
    let second = engine
        .deploy_process_version(1)
        .await
        .expect("Redeploy failed");
    assert!(
        std::sync::Arc::ptr_eq(&first, &second),
        "version 1 was deployed twice"
    );

    let other = engine
        .deploy_process_version(2)
        .await
        .expect("Version 2 deployment failed");
    assert!(
        !std::sync::Arc::ptr_eq(&first, &other),
        "versions share a deployment"
    );
    assert!(
        engine.deploy_process_version(9).await.is_err(),
        "an unstored version deployed"
    );
}

#[tokio::test]
async fn forwarded_instances_continue_under_their_own_id() {
    // Machine 1 forwards a statically bound token; machine 2 picks it up.
    let mut sender_config = test_config("machine-1");
    sender_config.known_machines = vec![peer("machine-2", "10.0.0.2", 33029)];
    let sender = test_bed(sender_config);
    let model = static_model("bound-flow", "machine-2");
    deploy(&sender, &model, 1).await;

    let (handlers, mut ended) = ended_channel();
    let instance_id = sender
        .management
        .create_instance("bound-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    recv_ended(&mut ended).await;

    // 1. What left machine 1 is exactly what machine 2 receives.
    let transfers = sender.network.sent_to_path("instance/");
    assert_eq!(transfers.len(), 1);
    let payload: InstanceSnapshot =
        serde_json::from_value(transfers[0].body.clone().expect("Transfer has no body"))
            .expect("Transfer body is not an instance snapshot");

    let receiver = test_bed(test_config("machine-2"));
    deploy(&receiver, &model, 1).await;
    let continued = receiver
        .management
        .continue_instance("bound-flow", payload)
        .await
        .expect("Continuation failed")
        .expect("The receiver refused the token");
    assert_eq!(continued, instance_id, "the instance changed its id in flight");

    // 2. The token finishes the process on machine 2, one hop richer, with
    //    the carried log intact.
    let engine = receiver
        .management
        .get_engine_with_definition_id("bound-flow")
        .expect("Engine disappeared");
    let info = wait_for_final_archive(&engine, &instance_id).await;
    assert_eq!(info.archive.info.instance_state, vec![InstanceState::Ended]);
    let token = &info.archive.info.tokens[0];
    assert_eq!(token.state, TokenState::Ended);
    assert_eq!(token.machine_hops, 1);

    let log = &info.archive.info.log;
    let start_entry = log
        .iter()
        .find(|e| e.flow_element_id == "start")
        .expect("Carried log entry lost");
    assert_eq!(start_entry.machine.id, "machine-1");
    assert_eq!(
        start_entry.next_machine.as_ref().map(|m| m.id.as_str()),
        Some("machine-2")
    );
    let work_entry = log
        .iter()
        .find(|e| e.flow_element_id == "work")
        .expect("No log entry for the forwarded node");
    assert_eq!(work_entry.machine.id, "machine-2");
}

#[tokio::test]
async fn continue_refuses_when_execution_is_deactivated() {
    let mut config = test_config("machine-2");
    config.processes.deactivate_process_execution = true;
    let bed = test_bed(config);
    deploy(&bed, &static_model("bound-flow", "machine-2"), 1).await;

    let payload = InstanceSnapshot {
        process_id: "bound-flow#1".to_string(),
        process_instance_id: "bound-flow#1-abc".to_string(),
        global_start_time: 1,
        instance_state: vec![InstanceState::Running],
        tokens: vec![{
            let mut token = prozess::model::Token::fresh("tok".to_string(), "work".to_string());
            token.from = Some("start".to_string());
            token.to = Some("work".to_string());
            token.state = TokenState::Forwarded;
            token
        }],
        variables: HashMap::new(),
        log: Vec::new(),
        adaptation_log: Vec::new(),
        calling_instance: None,
    };
    let continued = bed
        .management
        .continue_instance("bound-flow", payload)
        .await
        .expect("Continuation failed");
    assert!(continued.is_none());
}

#[tokio::test]
async fn paused_instances_resume_and_finish() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &user_task_model("review-flow"), 1).await;

    let mut variables = HashMap::new();
    variables.insert("customer".to_string(), json!("acme"));
    let instance_id = bed
        .management
        .create_instance("review-flow", 1, variables, None, Default::default(), None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    wait_for_pending_task(&bed.management).await;

    // 1. Pause parks the task and archives the instance PAUSED.
    bed.management
        .pause_instance_by_id(&instance_id)
        .await
        .expect("Pause failed");
    let engine = bed
        .management
        .get_engine_with_definition_id("review-flow")
        .expect("Engine disappeared");
    assert!(!engine.has_instance(&instance_id));

    // 2. Resume revives it under the same id; the task comes back READY.
    let resumed = bed
        .management
        .resume_instance("review-flow", &instance_id)
        .await
        .expect("Resume failed");
    assert_eq!(resumed, instance_id);
    let record = wait_for_pending_task(&bed.management).await;
    assert_eq!(record.state, UserTaskState::Ready);
    assert_eq!(record.instance_id, instance_id);

    // 3. Completing the task finishes the instance with its variables intact.
    engine
        .activate_user_task(&instance_id, "approve")
        .await
        .expect("Activation failed");
    engine
        .complete_user_task(&instance_id, "approve", HashMap::new())
        .await
        .expect("Completion failed");
    let info = wait_for_final_archive(&engine, &instance_id).await;
    assert_eq!(info.archive.info.instance_state, vec![InstanceState::Ended]);
    assert_eq!(
        info.archive.info.variables.get("customer").map(|v| &v.value),
        Some(&json!("acme"))
    );
}

#[tokio::test]
async fn resume_rejects_instances_that_are_not_paused() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &linear_model("order-flow"), 1).await;

    let (handlers, mut ended) = ended_channel();
    let instance_id = bed
        .management
        .create_instance("order-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    recv_ended(&mut ended).await;

    let outcome = bed
        .management
        .resume_instance("order-flow", &instance_id)
        .await;
    assert!(outcome.is_err(), "an ended instance must not resume");
}

#[tokio::test]
async fn inactive_user_tasks_come_from_the_archive() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &user_task_model("review-flow"), 1).await;

    let instance_id = bed
        .management
        .create_instance(
            "review-flow",
            1,
            HashMap::new(),
            None,
            Default::default(),
            None,
        )
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    wait_for_pending_task(&bed.management).await;
    bed.management
        .stop_instance_by_id(&instance_id)
        .await
        .expect("Stop failed");

    // The open task list is empty; the stopped task shows up as inactive.
    assert!(bed.management.get_pending_user_tasks().await.is_empty());
    let inactive = bed
        .management
        .get_inactive_user_tasks()
        .await
        .expect("Inactive task lookup failed");
    assert_eq!(inactive.len(), 1);
    let task = &inactive[0];
    assert_eq!(task.id, "approve");
    assert_eq!(task.state, UserTaskState::Stopped);
    assert_eq!(task.process_instance.id, instance_id);
    assert_eq!(task.definition_id, "review-flow");
}

#[tokio::test]
async fn removed_engines_leave_the_archive_behind() {
    let bed = test_bed(test_config("machine-1"));
    deploy(&bed, &linear_model("order-flow"), 1).await;

    let (handlers, mut ended) = ended_channel();
    let instance_id = bed
        .management
        .create_instance("order-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    recv_ended(&mut ended).await;

    bed.management.remove_process_engine("order-flow").await;
    assert!(bed
        .management
        .get_engine_with_definition_id("order-flow")
        .is_none());

    // The archive stays in storage.
    let archived = bed
        .ctx
        .storage
        .get_archived_instance("order-flow", &instance_id)
        .await
        .expect("Archive lookup failed")
        .expect("The archive went down with the engine");
    assert_eq!(archived.info.instance_state, vec![InstanceState::Ended]);

    // The stored definition still runs; a fresh engine deploys it on demand.
    let (handlers, mut ended) = ended_channel();
    bed.management
        .create_instance("order-flow", 1, HashMap::new(), None, handlers, None)
        .await
        .expect("Instance creation failed")
        .expect("Instance was not started");
    let snapshot = recv_ended(&mut ended).await;
    assert_eq!(snapshot.instance_state, vec![InstanceState::Ended]);
}
