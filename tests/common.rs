use async_trait::async_trait;
use gumdrop::Options;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use loadtree::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --quiet
///  --no-print-statistics
///  --min-sleep 0
///  --max-sleep 0
///  --no-controller (unless --controller-port is set)
pub fn build_configuration(custom: Vec<&str>) -> LoadTestConfiguration {
    // Start with the custom options.
    let mut configuration: Vec<&str> = custom.clone();

    if !configuration.contains(&"-q") && !configuration.contains(&"-v") {
        configuration.push("-q");
    }
    if !configuration.contains(&"--no-print-statistics") {
        configuration.push("--no-print-statistics");
    }
    if !configuration.contains(&"--min-sleep") {
        configuration.extend_from_slice(&["--min-sleep", "0"]);
    }
    if !configuration.contains(&"--max-sleep") {
        configuration.extend_from_slice(&["--max-sleep", "0"]);
    }
    if !configuration.contains(&"--controller-port") {
        configuration.push("--no-controller");
    }

    // Parse these options to generate a LoadTestConfiguration.
    LoadTestConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// A task that takes a couple of milliseconds.
#[allow(dead_code)]
pub async fn quick_task(_user: &mut VirtualUser) -> TaskResult {
    tokio::time::sleep(Duration::from_millis(2)).await;
    Ok(())
}

/// A task that always fails.
#[allow(dead_code)]
pub async fn failing_task(_user: &mut VirtualUser) -> TaskResult {
    Err("intentional failure".into())
}

/// Logs in by remembering the user's id.
#[allow(dead_code)]
pub async fn login(user: &mut VirtualUser) -> TaskResult {
    user.storage.set("session", user.id);
    Ok(())
}

/// The entry node "root" with a "profile" section of "view" (weight 10) and "edit"
/// (weight 1).
#[allow(dead_code)]
pub fn profile_tree() -> TaskNode {
    task!(login)
        .set_name("root")
        .register_section("profile", |profile| {
            profile
                .register_task(task!(quick_task).set_name("view").set_weight(10))
                .register_task(task!(quick_task).set_name("edit").set_weight(1))
        })
}

/// A tree with a single task, "root / work".
#[allow(dead_code)]
pub fn simple_tree() -> TaskNode {
    TaskNode::entry("root")
        .register_task(task!(quick_task).set_name("work"))
        .register_task(task!(failing_task).set_name("fail"))
}

/// A user that thinks for a fixed time between tasks and records when it spawned.
#[allow(dead_code)]
pub struct RecordingUser {
    pub think_time: Duration,
    pub spawned: Arc<Mutex<Vec<Instant>>>,
}
#[async_trait]
impl UserBehavior for RecordingUser {
    async fn on_spawn(&self, user: &mut VirtualUser) {
        self.spawned.lock().push(Instant::now());
        user.run_entry_task().await;
    }

    fn think_time(&self, _user: &VirtualUser) -> Duration {
        self.think_time
    }
}

/// Builds a load test whose users think for 10 milliseconds between tasks, returning
/// the spawn times users record.
#[allow(dead_code)]
pub fn build_load_test(
    configuration: LoadTestConfiguration,
    entry: TaskNode,
) -> (LoadTest, Arc<Mutex<Vec<Instant>>>) {
    let spawned = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&spawned);
    let load_test = LoadTest::initialize_with_config(configuration)
        .register_entry(entry)
        .set_user_factory(
            move |_id: usize| -> Result<Arc<dyn UserBehavior>, LoadTestError> {
                Ok(Arc::new(RecordingUser {
                    think_time: Duration::from_millis(10),
                    spawned: Arc::clone(&recorded),
                }))
            },
        );
    (load_test, spawned)
}

/// Polls `condition` every 50 milliseconds until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
