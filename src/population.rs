//! Reconciles the number of running virtual users with the desired population.
//!
//! The [`Population`] tracks every live user in a map guarded by its own lock. Once
//! per tick, [`Population::reconcile`] spawns users to make up a shortfall, or asks
//! surplus users to stop, and then derives the overall [`LoadTestStatus`].

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{self, Duration};

use crate::config::LoadTestConfiguration;
use crate::statistics::{RunEvent, StatisticsEngine};
use crate::task::TaskTree;
use crate::user::{
    user_main, SharedUserStatus, UserBehavior, UserFactory, UserStatus, VirtualUser,
};
use crate::LoadTestStatus;

/// How often the population is reconciled with its target.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

// The desired population, and whether the load test is shutting down. Kept under one
// lock so a new target can never land after shutdown has set it to 0.
#[derive(Debug, Default)]
struct Target {
    users: usize,
    shutting_down: bool,
}

struct PopulationMember {
    status: SharedUserStatus,
    spawned: time::Instant,
}

/// All live virtual users and the number there should be.
pub struct Population {
    users: Mutex<BTreeMap<usize, PopulationMember>>,
    target: Mutex<Target>,
    next_id: AtomicUsize,
    status: RwLock<LoadTestStatus>,
    // Set once the population reaches its target, cleared when it stops.
    reached_target: AtomicBool,
    tree: Arc<TaskTree>,
    configuration: Arc<LoadTestConfiguration>,
    factory: Arc<dyn UserFactory>,
    statistics: Arc<StatisticsEngine>,
    events: Mutex<Option<flume::Sender<RunEvent>>>,
}
impl Population {
    pub fn new(
        tree: Arc<TaskTree>,
        configuration: Arc<LoadTestConfiguration>,
        factory: Arc<dyn UserFactory>,
        statistics: Arc<StatisticsEngine>,
        events: flume::Sender<RunEvent>,
    ) -> Self {
        Population {
            users: Mutex::new(BTreeMap::new()),
            target: Mutex::new(Target::default()),
            next_id: AtomicUsize::new(0),
            status: RwLock::new(LoadTestStatus::Stopped),
            reached_target: AtomicBool::new(false),
            tree,
            configuration,
            factory,
            statistics,
            events: Mutex::new(Some(events)),
        }
    }

    /// Sets how many users should be running. Takes effect on the next reconciliation.
    /// Returns false, leaving the target unchanged, once shutting down.
    pub fn set_target(&self, target: usize) -> bool {
        let mut current = self.target.lock();
        if current.shutting_down {
            return false;
        }
        if current.users != target {
            info!("target population changed from {} to {}", current.users, target);
            current.users = target;
        }
        true
    }

    pub fn target(&self) -> usize {
        self.target.lock().users
    }

    /// Sets the target to 0 for good. Returns true the first time it is called.
    pub fn shut_down(&self) -> bool {
        let mut current = self.target.lock();
        if current.users != 0 {
            info!("target population changed from {} to 0", current.users);
            current.users = 0;
        }
        !std::mem::replace(&mut current.shutting_down, true)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.target.lock().shutting_down
    }

    /// The number of users in the population, including those still stopping.
    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().is_empty()
    }

    /// The number of users currently running tasks.
    pub fn running(&self) -> usize {
        self.users
            .lock()
            .values()
            .filter(|member| member.status.get() == UserStatus::Running)
            .count()
    }

    /// The overall status, as of the last reconciliation.
    pub fn status(&self) -> LoadTestStatus {
        *self.status.read()
    }

    /// Spawns or stops users to move toward the target, then updates the overall
    /// status, which is returned.
    pub fn reconcile(self: &Arc<Self>) -> LoadTestStatus {
        let target = self.target();
        let active = self.active();

        // The factory is user code, so it runs without the population lock held.
        let mut behaviors = Vec::new();
        if active < target {
            let missing = target - active;
            debug!("spawning {} users to reach {}", missing, target);
            for _ in 0..missing {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                match self.factory.create(id) {
                    Ok(behavior) => behaviors.push((id, behavior)),
                    Err(e) => {
                        warn!("failed to spawn user, retrying next tick: {}", e);
                        break;
                    }
                }
            }
        }

        let (total, running) = {
            let mut users = self.users.lock();
            for (id, behavior) in behaviors {
                self.spawn_user(&mut users, id, behavior, target);
            }

            let active: Vec<usize> = users
                .iter()
                .filter(|(_, member)| member.status.get().is_active())
                .map(|(id, _)| *id)
                .collect();
            if active.len() > target {
                let excess = active.len() - target;
                debug!("stopping {} users to reach {}", excess, target);
                // Which users stop is unspecified.
                for id in active.iter().take(excess) {
                    if let Some(member) = users.get(id) {
                        member.status.request_stop();
                    }
                }
            }

            let running = users
                .values()
                .filter(|member| member.status.get() == UserStatus::Running)
                .count();
            (users.len(), running)
        };

        let status = derive_status(target, total, running);
        self.update_status(status, total);
        status
    }

    // The number of users not yet asked to stop.
    fn active(&self) -> usize {
        self.users
            .lock()
            .values()
            .filter(|member| member.status.get().is_active())
            .count()
    }

    // Registers a new user and starts its run loop. Called with the population lock held.
    fn spawn_user(
        self: &Arc<Self>,
        users: &mut BTreeMap<usize, PopulationMember>,
        id: usize,
        behavior: Arc<dyn UserBehavior>,
        target: usize,
    ) {
        let status = SharedUserStatus::new(UserStatus::Spawning);
        let events = self.events.lock().clone();
        let user = VirtualUser::with_status(
            id,
            Arc::clone(&self.tree),
            Arc::clone(&self.configuration),
            status.clone(),
            events,
        );

        let stagger = stagger(id, target, self.configuration.spawn_rate());
        users.insert(
            id,
            PopulationMember {
                status,
                spawned: time::Instant::now(),
            },
        );
        let _ignored = tokio::spawn(user_main(user, behavior, stagger, Arc::clone(self)));
    }

    /// Removes a user whose run loop has exited.
    pub(crate) fn remove(&self, id: usize) {
        if let Some(member) = self.users.lock().remove(&id) {
            debug!("user {} removed after {:?}", id, member.spawned.elapsed());
        }
    }

    /// Asks every user to stop by setting the target to 0.
    pub fn stop_all(&self) {
        self.set_target(0);
    }

    /// Drops the population's run event sender, so the statistics channel closes once
    /// every user has exited. No further users report statistics.
    pub(crate) fn close_events(&self) {
        self.events.lock().take();
    }

    fn update_status(&self, status: LoadTestStatus, total: usize) {
        let previous = {
            let mut current = self.status.write();
            std::mem::replace(&mut *current, status)
        };
        self.statistics.set_population(total, status);
        if previous == status {
            return;
        }

        info!("load test status changed from {} to {}", previous, status);
        if previous == LoadTestStatus::Stopped {
            self.statistics.mark_started();
        }
        match status {
            LoadTestStatus::Running => {
                if !self.reached_target.swap(true, Ordering::SeqCst) {
                    if self.configuration.no_reset_statistics {
                        info!("all {} users running", total);
                    } else {
                        info!("all {} users running, resetting statistics", total);
                        self.statistics.reset();
                    }
                }
            }
            LoadTestStatus::Stopped => {
                self.reached_target.store(false, Ordering::SeqCst);
                self.statistics.mark_ended();
            }
            _ => (),
        }
    }
}

/// How long user `id` waits before starting, spreading `target` users across the spawn
/// rate. Delays too long to represent are capped at [`Duration::MAX`].
pub fn stagger(id: usize, target: usize, spawn_rate: f32) -> Duration {
    let offset = (id % target.max(1)) as f32;
    Duration::try_from_secs_f32(offset / spawn_rate).unwrap_or_else(|e| {
        warn!(
            "user {} cannot be staggered at {} users per second ({}), waiting indefinitely",
            id, spawn_rate, e
        );
        Duration::MAX
    })
}

/// Derives the overall status from the target and the population.
pub fn derive_status(target: usize, total: usize, running: usize) -> LoadTestStatus {
    if total == 0 && target == 0 {
        LoadTestStatus::Stopped
    } else if target > 0 && running == target && total == target {
        LoadTestStatus::Running
    } else if running < target {
        LoadTestStatus::Spawning
    } else {
        LoadTestStatus::Stopping
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{TaskNode, TaskResult};
    use crate::user::{DefaultUser, DefaultUserFactory};
    use crate::LoadTestError;
    use std::sync::Weak;
    use gumdrop::Options;

    // A user whose setup always panics.
    struct PanickingUser;
    #[async_trait::async_trait]
    impl UserBehavior for PanickingUser {
        async fn on_spawn(&self, _user: &mut VirtualUser) {
            panic!("no session available");
        }
    }

    async fn noop(_user: &mut VirtualUser) -> TaskResult {
        Ok(())
    }

    fn population(args: &[&str], factory: Arc<dyn UserFactory>) -> Arc<Population> {
        let mut configuration = LoadTestConfiguration::parse_args_default(args).unwrap();
        configuration.configure(&Default::default());
        let tree =
            TaskTree::build(TaskNode::entry("root").register_task(task!(noop).set_name("a")))
                .unwrap();
        let (tx, _rx) = flume::unbounded();
        Arc::new(Population::new(
            Arc::new(tree),
            Arc::new(configuration),
            factory,
            Arc::new(StatisticsEngine::new()),
            tx,
        ))
    }

    #[test]
    fn derived_status() {
        assert_eq!(derive_status(0, 0, 0), LoadTestStatus::Stopped);
        assert_eq!(derive_status(5, 0, 0), LoadTestStatus::Spawning);
        assert_eq!(derive_status(5, 5, 3), LoadTestStatus::Spawning);
        assert_eq!(derive_status(5, 5, 5), LoadTestStatus::Running);
        // Surplus users are still exiting.
        assert_eq!(derive_status(5, 7, 5), LoadTestStatus::Stopping);
        assert_eq!(derive_status(0, 2, 0), LoadTestStatus::Stopping);
        assert_eq!(derive_status(0, 2, 2), LoadTestStatus::Stopping);
    }

    #[tokio::test]
    async fn spawn_and_stop() {
        let population = population(
            &["--min-sleep", "0", "--max-sleep", "0", "-r", "100"],
            Arc::new(DefaultUserFactory),
        );
        assert_eq!(population.reconcile(), LoadTestStatus::Stopped);

        population.set_target(4);
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        assert_eq!(population.len(), 4);

        // Users start within a few milliseconds at this spawn rate.
        let mut status = LoadTestStatus::Spawning;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = population.reconcile();
            if status == LoadTestStatus::Running {
                break;
            }
        }
        assert_eq!(status, LoadTestStatus::Running);
        assert_eq!(population.running(), 4);
        // Reaching the target resets statistics once.
        assert!(population.reached_target.load(Ordering::SeqCst));

        population.set_target(1);
        assert_eq!(population.reconcile(), LoadTestStatus::Stopping);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = population.reconcile();
            if status == LoadTestStatus::Running {
                break;
            }
        }
        assert_eq!(status, LoadTestStatus::Running);
        assert_eq!(population.len(), 1);

        population.stop_all();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = population.reconcile();
            if status == LoadTestStatus::Stopped {
                break;
            }
        }
        assert_eq!(status, LoadTestStatus::Stopped);
        assert!(population.is_empty());
        assert!(!population.reached_target.load(Ordering::SeqCst));
        assert!(population.statistics.snapshot().aggregate.end_time.is_some());
    }

    #[tokio::test]
    async fn failing_factory() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let factory = move |id: usize| -> Result<Arc<dyn UserBehavior>, LoadTestError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LoadTestError::UserFactory {
                id,
                detail: "no accounts left".to_string(),
            })
        };
        let population = population(&[], Arc::new(factory));
        population.set_target(3);

        // Each tick gives up after the first failure and tries again next tick.
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert!(population.is_empty());
    }

    #[tokio::test]
    async fn panicking_spawn() {
        let factory = |_id: usize| -> Result<Arc<dyn UserBehavior>, LoadTestError> {
            Ok(Arc::new(PanickingUser))
        };
        let population = population(&["-r", "100"], Arc::new(factory));
        population.set_target(2);
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        assert_eq!(population.len(), 2);

        // Users whose setup panics leave the population instead of lingering.
        for _ in 0..50 {
            if population.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(population.is_empty());

        population.stop_all();
        assert_eq!(population.reconcile(), LoadTestStatus::Stopped);
    }

    #[tokio::test]
    async fn factory_sees_population() {
        let slot: Arc<Mutex<Option<Weak<Population>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            move |_id: usize| -> Result<Arc<dyn UserBehavior>, LoadTestError> {
                let population = slot.lock().as_ref().and_then(Weak::upgrade);
                if let Some(population) = population {
                    seen.lock().push(population.len());
                }
                Ok(Arc::new(DefaultUser))
            }
        };
        let population = population(&["-r", "100"], Arc::new(factory));
        *slot.lock() = Some(Arc::downgrade(&population));

        population.set_target(3);
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        // Every behavior is created before any new user joins the population.
        assert_eq!(*seen.lock(), vec![0, 0, 0]);
        assert_eq!(population.len(), 3);
    }

    #[test]
    fn stagger_delays() {
        assert_eq!(stagger(0, 10, 2.0), Duration::ZERO);
        assert_eq!(stagger(3, 10, 2.0), Duration::from_millis(1_500));
        // Ids wrap around the target.
        assert_eq!(stagger(13, 10, 2.0), Duration::from_millis(1_500));
        assert_eq!(stagger(5, 0, 1.0), Duration::ZERO);
        // Rates this slow cannot be represented and are capped.
        assert_eq!(stagger(1, 2, 1e-20), Duration::MAX);
    }

    #[tokio::test]
    async fn tiny_spawn_rate() {
        let population = population(
            &["-r", "0.00000000000000000001"],
            Arc::new(DefaultUserFactory),
        );
        population.set_target(2);
        assert_eq!(population.reconcile(), LoadTestStatus::Spawning);
        assert_eq!(population.len(), 2);

        // The user waiting to start still notices the stop.
        population.stop_all();
        let mut status = population.reconcile();
        for _ in 0..50 {
            if status == LoadTestStatus::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            status = population.reconcile();
        }
        assert_eq!(status, LoadTestStatus::Stopped);
    }

    #[test]
    fn shutdown_wins_over_new_targets() {
        for _ in 0..20 {
            let population = population(&[], Arc::new(DefaultUserFactory));
            let setter = {
                let population = Arc::clone(&population);
                std::thread::spawn(move || {
                    for users in 1..500 {
                        population.set_target(users);
                    }
                })
            };
            assert!(population.shut_down());
            setter.join().unwrap();

            assert_eq!(population.target(), 0);
            assert!(population.is_shutting_down());
            assert!(!population.set_target(3));
            assert!(!population.shut_down());
            assert_eq!(population.target(), 0);
        }
    }

    #[test]
    fn restart_clears_end_time() {
        let population = population(&["--no-reset-statistics"], Arc::new(DefaultUserFactory));
        population.statistics.mark_ended();
        assert!(population.statistics.snapshot().aggregate.end_time.is_some());

        // Users can all be running by the first count after a restart.
        population.update_status(LoadTestStatus::Running, 1);
        let snapshot = population.statistics.snapshot();
        assert!(snapshot.aggregate.end_time.is_none());
        assert_eq!(snapshot.aggregate.status, LoadTestStatus::Running);

        population.update_status(LoadTestStatus::Stopped, 0);
        assert!(population.statistics.snapshot().aggregate.end_time.is_some());
    }
}
