use std::sync::Arc;

use loadtree::prelude::*;
use loadtree::statistics::StatisticsEngine;

mod common;
use common::failing_task;

// Drives one user through the profile tree until `runs` tasks have executed, feeding
// every event into a statistics engine.
async fn run_profile_scenario(runs: u64) -> StatisticsSnapshot {
    let configuration = common::build_configuration(vec![]);
    let tree = Arc::new(TaskTree::build(common::profile_tree()).unwrap());
    let (tx, rx) = flume::unbounded();
    let mut user = VirtualUser::new(1, tree, Arc::new(configuration), tx);
    let statistics = StatisticsEngine::new();

    user.run_entry_task().await.unwrap();
    assert_eq!(user.storage.get::<usize>("session"), Some(&1));

    let mut executed = 0;
    let mut selections = 0;
    while executed < runs {
        selections += 1;
        if user.tick().await.unwrap().is_some() {
            executed += 1;
        }
    }
    // Stepping into the profile section doesn't run anything.
    assert!(selections > runs);

    drop(user);
    for event in rx.drain() {
        statistics.ingest(&event);
    }
    statistics.snapshot()
}

#[tokio::test]
async fn test_profile_scenario() {
    let snapshot = run_profile_scenario(1_100).await;

    // The entry task ran once, then 1,100 tasks were selected.
    assert_eq!(snapshot.aggregate.num_total, 1_101);
    assert_eq!(snapshot.tasks["root"].num_total, 1);

    let view = &snapshot.tasks["root / profile / view"];
    let edit = &snapshot.tasks["root / profile / edit"];
    assert_eq!(view.num_total + edit.num_total, 1_100);
    assert!(view.num_total > 0 && edit.num_total > 0);
    // Roughly 1,000 views and 100 edits.
    assert!(
        (900..=1_080).contains(&view.num_total),
        "view ran {} times",
        view.num_total
    );
    assert!(
        (20..=200).contains(&edit.num_total),
        "edit ran {} times",
        edit.num_total
    );

    // Both tasks ran enough to report percentiles.
    for task in [view, edit] {
        assert_eq!(task.num_successful, task.num_total);
        assert_eq!(task.durations.values().sum::<u64>(), task.num_total);
        assert!(task.percentiles[&50] >= 2);
        assert!(task.percentiles[&50] <= task.percentiles[&99]);
    }
}

#[tokio::test]
async fn test_failures_are_recorded() {
    let configuration = common::build_configuration(vec![]);
    let entry = TaskNode::entry("root")
        .set_strategy(SelectionStrategy::InOrder)
        .register_task(task!(quick_task_ok).set_name("ok"))
        .register_task(task!(failing_task).set_name("fail"));
    let tree = Arc::new(TaskTree::build(entry).unwrap());
    let (tx, rx) = flume::unbounded();
    let mut user = VirtualUser::new(3, tree, Arc::new(configuration), tx);

    // A user without an entry function runs nothing when it spawns.
    assert!(user.run_entry_task().await.is_none());

    // InOrder alternates between the two tasks, failures don't stop the user.
    for _ in 0..20 {
        assert!(user.tick().await.unwrap().is_some());
    }
    drop(user);

    let statistics = StatisticsEngine::new();
    for event in rx.drain() {
        statistics.ingest(&event);
    }
    let snapshot = statistics.snapshot();
    assert_eq!(snapshot.aggregate.num_total, 20);
    assert_eq!(snapshot.aggregate.num_failed, 10);
    let fail = &snapshot.tasks["root / fail"];
    assert_eq!(fail.num_failed, 10);
    assert_eq!(fail.errors["intentional failure"], 10);
    assert_eq!(snapshot.tasks["root / ok"].num_successful, 10);
}

async fn quick_task_ok(_user: &mut VirtualUser) -> TaskResult {
    Ok(())
}
