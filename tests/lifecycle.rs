use serial_test::serial;
use std::time::Duration;

use loadtree::prelude::*;

mod common;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handle() {
    let configuration =
        common::build_configuration(vec!["-u", "3", "-r", "100", "--no-autostart"]);
    let (load_test, _spawned) = common::build_load_test(configuration, common::simple_tree());
    let handle = load_test.start().await.unwrap();

    // Nothing runs until the test is started.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.status(), LoadTestStatus::Stopped);
    assert_eq!(handle.target(), 0);
    assert_eq!(handle.population(), 0);

    assert!(handle.start());
    assert_eq!(handle.target(), 3);
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle.status() == LoadTestStatus::Running
        })
        .await
    );
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle.snapshot().aggregate.num_total > 0
        })
        .await
    );

    let json: serde_json::Value = serde_json::from_str(&handle.snapshot_json().unwrap()).unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["users"], 3);
    assert!(json["tasks"]["root / work"]["num_total"].as_u64().is_some());

    let json: serde_json::Value =
        serde_json::from_str(&handle.configuration_json().unwrap()).unwrap();
    assert_eq!(json["users"], 3);
    assert_eq!(handle.configuration().users(), 3);

    // Stopping returns the test to idle.
    assert!(handle.request_stop());
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle.status() == LoadTestStatus::Stopped
        })
        .await
    );
    assert_eq!(handle.population(), 0);
    assert!(handle.snapshot().aggregate.end_time.is_some());

    // Let ingestion catch up with the last runs.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.reset_statistics();
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.aggregate.num_total, 0);
    assert!(snapshot.tasks.values().all(|task| task.num_total == 0));

    // An idle test can be started again.
    assert!(handle.set_target_population(1));
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle.status() == LoadTestStatus::Running
        })
        .await
    );
    assert!(handle.snapshot().aggregate.end_time.is_none());

    handle.shutdown();
    assert!(handle.is_shutting_down());
    assert!(!handle.set_target_population(5));
    let snapshot = handle.wait().await.unwrap();
    assert_eq!(snapshot.aggregate.status, LoadTestStatus::Stopped);

    // Waiting again returns the statistics as they are.
    let again = handle.wait().await.unwrap();
    assert_eq!(again.aggregate.num_total, snapshot.aggregate.num_total);
}

async fn panicking_task(_user: &mut VirtualUser) -> TaskResult {
    panic!("task blew up")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_task() {
    let configuration = common::build_configuration(vec!["-u", "1", "-r", "100"]);
    let entry = TaskNode::entry("root").register_task(task!(panicking_task).set_name("boom"));
    let (load_test, _spawned) = common::build_load_test(configuration, entry);
    let handle = load_test.start().await.unwrap();

    // The user survives its task panicking, and each panic counts as a failure.
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle.status() == LoadTestStatus::Running
        })
        .await
    );
    assert!(
        common::wait_for(Duration::from_secs(5), || {
            handle
                .snapshot()
                .tasks
                .get("root / boom")
                .is_some_and(|task| task.num_failed >= 3)
        })
        .await
    );
    assert_eq!(handle.population(), 1);
    let snapshot = handle.snapshot();
    let boom = &snapshot.tasks["root / boom"];
    assert_eq!(boom.num_successful, 0);
    assert!(boom.errors.contains_key("task panicked: task blew up"));

    handle.shutdown();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("load test did not end after shutdown")
        .unwrap();
    assert_eq!(snapshot.aggregate.status, LoadTestStatus::Stopped);
    assert_eq!(handle.population(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_while_changing_target() {
    let configuration = common::build_configuration(vec!["-u", "2", "-r", "100"]);
    let (load_test, _spawned) = common::build_load_test(configuration, common::simple_tree());
    let handle = load_test.start().await.unwrap();

    let setters: Vec<_> = (0..4)
        .map(|offset| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for users in 0..200 {
                    handle.set_target_population(1 + (users + offset) % 5);
                }
            })
        })
        .collect();
    handle.shutdown();
    for setter in setters {
        setter.join().unwrap();
    }

    // No target set concurrently with the shutdown outlives it.
    assert_eq!(handle.target(), 0);
    let snapshot = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("load test did not end after shutdown")
        .unwrap();
    assert_eq!(snapshot.aggregate.status, LoadTestStatus::Stopped);
}

#[tokio::test]
async fn test_invalid_configuration() {
    let configuration = common::build_configuration(vec!["--min-sleep", "3", "--max-sleep", "1"]);
    let result = LoadTest::initialize_with_config(configuration)
        .register_entry(common::simple_tree())
        .start()
        .await;
    assert!(matches!(result, Err(LoadTestError::InvalidSleepTime { .. })));

    let configuration = common::build_configuration(vec![]);
    let result = LoadTest::initialize_with_config(configuration).start().await;
    assert!(matches!(result, Err(LoadTestError::NoEntryTask { .. })));

    let configuration = common::build_configuration(vec![]);
    let result = LoadTest::initialize_with_config(configuration)
        .register_entry(TaskNode::entry("empty"))
        .start()
        .await;
    assert!(matches!(result, Err(LoadTestError::InvalidTaskTree { .. })));
}

#[test]
#[serial]
fn test_execute_with_run_time() {
    let configuration = common::build_configuration(vec!["-u", "2", "-r", "10", "-t", "3"]);
    let (load_test, spawned) = common::build_load_test(configuration, common::profile_tree());
    let snapshot = load_test.execute().unwrap();

    assert_eq!(spawned.lock().len(), 2);
    assert_eq!(snapshot.aggregate.status, LoadTestStatus::Stopped);
    assert!(snapshot.aggregate.end_time.is_some());
    // Statistics were reset once both users were running.
    assert!(snapshot.aggregate.num_total > 0);
    assert!(!snapshot.tasks.contains_key("root") || snapshot.tasks["root"].num_total == 0);
}

#[test]
#[serial]
fn test_execute_with_defaults() {
    let load_test = LoadTest::initialize_with_config(common::build_configuration(vec![]))
        .register_entry(common::simple_tree())
        .set_default(LoadTestDefault::Users, 1)
        .unwrap()
        .set_default(LoadTestDefault::RunTime, 2)
        .unwrap()
        .set_default(LoadTestDefault::SpawnRate, "5")
        .unwrap();
    let snapshot = load_test.execute().unwrap();
    assert!(snapshot.tasks["root / work"].num_total > 0);
}
