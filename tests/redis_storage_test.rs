use prozess::model::{ArchivedInstance, InstanceSnapshot, InstanceState, Token, TokenState};
use prozess::storage::{ProcessStorage, RedisStorage};
use std::collections::HashMap;

// Helper to get the redis url; db 6 is flushed by the test.
fn redis_url() -> String {
    let host = "127.0.0.1";
    let port = 6379;
    let db = 6;
    format!("redis://{}:{}/{}", host, port, db)
}

fn archive_for(instance_id: &str, state: TokenState) -> ArchivedInstance {
    let mut token = Token::fresh("t1", "work");
    token.state = state;
    ArchivedInstance {
        info: InstanceSnapshot {
            process_id: "redis-flow#1".to_string(),
            process_instance_id: instance_id.to_string(),
            global_start_time: 1_700_000_000_000,
            instance_state: vec![InstanceState::Running],
            tokens: vec![token],
            variables: HashMap::new(),
            log: Vec::new(),
            adaptation_log: Vec::new(),
            calling_instance: None,
        },
        is_currently_executed_in_bpmn_engine: true,
        user_tasks: Vec::new(),
    }
}

#[tokio::test]
#[ignore] // Ignored by default, run explicitly if redis is available
async fn redis_storage_round_trips_deployments_and_archives() {
    // 1. Setup Redis & Clean DB
    let client = redis::Client::open(redis_url()).expect("Invalid Redis URL");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");
    let _: () = redis::cmd("FLUSHDB")
        .query_async(&mut conn)
        .await
        .expect("Failed to flush db");

    let storage = RedisStorage::new(&redis_url()).expect("Invalid Redis URL");

    // 2. Process versions
    storage
        .save_process_version("redis-flow", 1, r#"{"id":"redis-flow","flowNodes":[]}"#)
        .await
        .expect("Failed to save the model");
    storage
        .save_process_version("redis-flow", 2, r#"{"id":"redis-flow","flowNodes":[],"v":2}"#)
        .await
        .expect("Failed to save the second version");
    let stored = storage
        .get_process_version("redis-flow", 2)
        .await
        .expect("Failed to read the model")
        .expect("Version 2 is gone");
    assert!(stored.contains(r#""v":2"#));
    assert_eq!(
        storage.get_all_processes().await.expect("Failed to list processes"),
        vec!["redis-flow".to_string()]
    );

    // 3. User task html
    storage
        .save_html("redis-flow", "approve.html", "<form></form>")
        .await
        .expect("Failed to save html");
    assert_eq!(
        storage
            .get_html("redis-flow", "approve.html")
            .await
            .expect("Failed to read html"),
        Some("<form></form>".to_string())
    );
    assert_eq!(
        storage
            .get_all_user_task_files("redis-flow")
            .await
            .expect("Failed to list html files"),
        vec!["approve.html".to_string()]
    );

    // 4. Instance archives survive a fresh connection
    let archive = archive_for("redis-flow#1-abc", TokenState::Running);
    storage
        .archive_instance("redis-flow", "redis-flow#1-abc", &archive)
        .await
        .expect("Failed to archive the instance");

    let reopened = RedisStorage::new(&redis_url()).expect("Invalid Redis URL");
    let restored = reopened
        .get_archived_instance("redis-flow", "redis-flow#1-abc")
        .await
        .expect("Failed to read the archive")
        .expect("Archive did not survive the reconnect");
    assert!(restored.is_currently_executed_in_bpmn_engine);
    assert_eq!(restored.info.tokens[0].state, TokenState::Running);
    assert_eq!(restored.info.global_start_time, 1_700_000_000_000);

    // 5. Deleting one archive leaves the rest alone
    let second = archive_for("redis-flow#1-def", TokenState::Ended);
    storage
        .archive_instance("redis-flow", "redis-flow#1-def", &second)
        .await
        .expect("Failed to archive the second instance");
    storage
        .delete_archived_instance("redis-flow", "redis-flow#1-abc")
        .await
        .expect("Failed to delete the archive");
    let remaining = storage
        .get_archived_instances("redis-flow")
        .await
        .expect("Failed to list archives");
    assert_eq!(remaining.len(), 1);
    assert!(remaining.contains_key("redis-flow#1-def"));

    // 6. Dropping the process clears every key it owned
    storage
        .delete_process("redis-flow")
        .await
        .expect("Failed to delete the process");
    assert!(storage
        .get_all_processes()
        .await
        .expect("Failed to list processes")
        .is_empty());
    assert!(storage
        .get_process_version("redis-flow", 1)
        .await
        .expect("Failed to read the model")
        .is_none());
    assert!(storage
        .get_archived_instances("redis-flow")
        .await
        .expect("Failed to list archives")
        .is_empty());
}
