//! Virtual users and their run loop.
//!
//! A [`VirtualUser`] is created by the population controller, bound to the shared
//! [`TaskTree`], and driven by [`user_main`] until it is told to stop: it selects a
//! node, runs it if it has a function, then thinks (sleeps) before selecting again.

use async_trait::async_trait;
use downcast_rs::{impl_downcast, DowncastSync};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{self, Duration};

use crate::config::LoadTestConfiguration;
use crate::population::Population;
use crate::selector::{SelectionError, Selector};
use crate::statistics::RunEvent;
use crate::task::{NodeId, TaskError, TaskTree};
use crate::LoadTestError;

/// Never sleep more than this many milliseconds at once, so stop requests are noticed
/// promptly.
const MAXIMUM_SLEEP_SLICE: u64 = 500;

/// The lifecycle of a virtual user. Users only ever move forward through these states.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    /// Created and waiting out its stagger delay or running its entry task.
    Spawning,
    /// Selecting and running tasks.
    Running,
    /// Asked to stop, will exit after its current task.
    Stopping,
    /// Its run loop has exited.
    Stopped,
}
impl UserStatus {
    fn as_u8(self) -> u8 {
        match self {
            UserStatus::Spawning => 0,
            UserStatus::Running => 1,
            UserStatus::Stopping => 2,
            UserStatus::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> UserStatus {
        match value {
            0 => UserStatus::Spawning,
            1 => UserStatus::Running,
            2 => UserStatus::Stopping,
            _ => UserStatus::Stopped,
        }
    }

    /// Returns true if the user has not yet been asked to stop.
    pub fn is_active(self) -> bool {
        matches!(self, UserStatus::Spawning | UserStatus::Running)
    }
}

/// A user's status, shared between the user's run loop and the population controller.
#[derive(Clone, Debug)]
pub struct SharedUserStatus(Arc<AtomicU8>);
impl SharedUserStatus {
    pub fn new(status: UserStatus) -> Self {
        SharedUserStatus(Arc::new(AtomicU8::new(status.as_u8())))
    }

    pub fn get(&self) -> UserStatus {
        UserStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: UserStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    /// Atomically moves from `from` to `to`, returning false if the status was not `from`.
    pub fn transition(&self, from: UserStatus, to: UserStatus) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Signals the user to stop. Returns false if it was already stopping or stopped.
    pub fn request_stop(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if UserStatus::from_u8(current).is_active() {
                    Some(UserStatus::Stopping.as_u8())
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// Errors reading from [`UserStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Nothing is stored under the key.
    Missing { key: String },
    /// The stored value is not of the requested type.
    WrongType { key: String, expected: &'static str },
}
impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::Missing { key } => write!(f, "no value stored for key {}", key),
            StorageError::WrongType { key, expected } => {
                write!(f, "value stored for key {} is not a {}", key, expected)
            }
        }
    }
}

impl std::error::Error for StorageError {}

/// Any value that can be kept in [`UserStorage`].
pub trait StorageValue: DowncastSync {}
impl<T: Send + Sync + 'static> StorageValue for T {}
impl_downcast!(sync StorageValue);

/// Private key/value storage of a single virtual user, for example to hold an
/// authentication token between tasks.
///
/// ```rust
/// use loadtree::user::UserStorage;
///
/// let mut storage = UserStorage::default();
/// storage.set("token", "secret".to_string());
/// storage.set("visits", 3_i64);
/// assert_eq!(storage.get_string("token").unwrap(), "secret");
/// assert_eq!(storage.get_int("visits").unwrap(), 3);
/// assert!(storage.get_int("token").is_err());
/// ```
#[derive(Default)]
pub struct UserStorage {
    data: HashMap<String, Box<dyn StorageValue>>,
}
impl UserStorage {
    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T: StorageValue>(&mut self, key: &str, value: T) {
        self.data.insert(key.to_string(), Box::new(value));
    }

    /// Returns the value stored under `key` if there is one of type `T`.
    pub fn get<T: StorageValue>(&self, key: &str) -> Option<&T> {
        self.data
            .get(key)
            .and_then(|value| (**value).downcast_ref::<T>())
    }

    /// Returns a mutable reference to the value stored under `key` if there is one of
    /// type `T`.
    pub fn get_mut<T: StorageValue>(&mut self, key: &str) -> Option<&mut T> {
        self.data
            .get_mut(key)
            .and_then(|value| (**value).downcast_mut::<T>())
    }

    /// Removes the value stored under `key`, returning true if there was one.
    pub fn remove(&mut self, key: &str) -> bool {
        self.data.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the integer stored under `key`. Any primitive integer type that fits in
    /// an `i64` is accepted.
    pub fn get_int(&self, key: &str) -> Result<i64, StorageError> {
        let value = self.data.get(key).ok_or_else(|| StorageError::Missing {
            key: key.to_string(),
        })?;
        let value: &dyn StorageValue = &**value;
        let int = if let Some(v) = value.downcast_ref::<i64>() {
            Some(*v)
        } else if let Some(v) = value.downcast_ref::<i32>() {
            Some(i64::from(*v))
        } else if let Some(v) = value.downcast_ref::<u32>() {
            Some(i64::from(*v))
        } else if let Some(v) = value.downcast_ref::<usize>() {
            i64::try_from(*v).ok()
        } else if let Some(v) = value.downcast_ref::<u64>() {
            i64::try_from(*v).ok()
        } else {
            None
        };
        int.ok_or_else(|| StorageError::WrongType {
            key: key.to_string(),
            expected: "integer",
        })
    }

    /// Returns the string stored under `key`, accepting both `String` and `&'static str`.
    pub fn get_string(&self, key: &str) -> Result<&str, StorageError> {
        let value = self.data.get(key).ok_or_else(|| StorageError::Missing {
            key: key.to_string(),
        })?;
        let value: &dyn StorageValue = &**value;
        if let Some(v) = value.downcast_ref::<String>() {
            Ok(v.as_str())
        } else if let Some(v) = value.downcast_ref::<&'static str>() {
            Ok(*v)
        } else {
            Err(StorageError::WrongType {
                key: key.to_string(),
                expected: "string",
            })
        }
    }
}
impl fmt::Debug for UserStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut keys: Vec<&String> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("UserStorage").field("keys", &keys).finish()
    }
}

/// A single simulated user, passed to every task function it runs.
pub struct VirtualUser {
    /// Unique identifier, stable for the lifetime of the user.
    pub id: usize,
    /// Private storage for data that should persist between this user's tasks.
    pub storage: UserStorage,
    selector: Selector,
    tree: Arc<TaskTree>,
    configuration: Arc<LoadTestConfiguration>,
    status: SharedUserStatus,
    events: Option<flume::Sender<RunEvent>>,
    current_task: Option<String>,
}
impl VirtualUser {
    /// Creates a user positioned at the entry node of `tree`. Each task it runs is
    /// reported on `events`.
    pub fn new(
        id: usize,
        tree: Arc<TaskTree>,
        configuration: Arc<LoadTestConfiguration>,
        events: flume::Sender<RunEvent>,
    ) -> Self {
        VirtualUser::with_status(
            id,
            tree,
            configuration,
            SharedUserStatus::new(UserStatus::Spawning),
            Some(events),
        )
    }

    pub(crate) fn with_status(
        id: usize,
        tree: Arc<TaskTree>,
        configuration: Arc<LoadTestConfiguration>,
        status: SharedUserStatus,
        events: Option<flume::Sender<RunEvent>>,
    ) -> Self {
        trace!("new user {}", id);
        VirtualUser {
            id,
            storage: UserStorage::default(),
            selector: Selector::new(&tree),
            tree,
            configuration,
            status,
            events,
            current_task: None,
        }
    }

    pub fn status(&self) -> UserStatus {
        self.status.get()
    }

    /// A handle on this user's status, for signaling a stop from elsewhere.
    pub fn shared_status(&self) -> SharedUserStatus {
        self.status.clone()
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    pub fn configuration(&self) -> &LoadTestConfiguration {
        &self.configuration
    }

    /// The configured request timeout. Not enforced on tasks, but available for
    /// them to apply to their own requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.configuration.request_timeout() as u64)
    }

    /// The node this user is currently positioned at.
    pub fn position(&self) -> NodeId {
        self.selector.current()
    }

    /// The full name of the task currently running, if any.
    pub fn current_task(&self) -> Option<&str> {
        self.current_task.as_deref()
    }

    /// Runs the entry node's function, if it has one.
    pub async fn run_entry_task(&mut self) -> Option<RunEvent> {
        let root = self.tree.root();
        self.run_task(root).await
    }

    /// Selects the next node and runs it if it has a function.
    ///
    /// Returns the event recorded for the task that ran, or `None` if selection only
    /// moved the user into a section.
    pub async fn tick(&mut self) -> Result<Option<RunEvent>, SelectionError> {
        let node = {
            let mut rng = rand::rng();
            self.selector.select(&self.tree, &mut rng)?
        };
        Ok(self.run_task(node).await)
    }

    /// Runs and times the function of `node`, reporting the outcome. Sections have no
    /// function and are skipped.
    pub(crate) async fn run_task(&mut self, node: NodeId) -> Option<RunEvent> {
        let function = self.tree.node(node).function.clone()?;
        let name = self.tree.full_name(node).to_string();
        debug!("user {}: launching {}", self.id, name);

        self.current_task = Some(name.clone());
        let started = time::Instant::now();
        // A panicking task is recorded as a failure and the user carries on.
        let result = match AssertUnwindSafe(function(&mut *self)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("user {}: {} panicked: {}", self.id, name, message);
                Err(TaskError::Panicked(message))
            }
        };
        let elapsed = started.elapsed();
        self.current_task = None;

        if let Err(e) = &result {
            debug!("user {}: {} failed: {}", self.id, name, e);
        }
        let event = RunEvent::new(name, elapsed, &result);
        if let Some(events) = &self.events {
            // The receiver only goes away once the load test is over.
            if events.send(event.clone()).is_err() {
                debug!("user {}: statistics channel closed", self.id);
            }
        }
        Some(event)
    }

    /// A think time drawn uniformly from `[min_sleep, max_sleep)` seconds.
    pub fn default_think_time(&self) -> Duration {
        let min_sleep = self.configuration.min_sleep() as f64;
        let max_sleep = self.configuration.max_sleep() as f64;
        if max_sleep <= min_sleep {
            return Duration::from_secs_f64(min_sleep);
        }
        Duration::from_secs_f64(rand::rng().random_range(min_sleep..max_sleep))
    }

    /// Sleeps for `duration`, returning early if the user is asked to stop.
    pub async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            // Give other users a turn.
            tokio::task::yield_now().await;
            return;
        }
        let mut remaining = duration;
        while !remaining.is_zero() {
            if !self.status().is_active() {
                debug!("user {}: stop requested while sleeping", self.id);
                return;
            }
            let slice = remaining.min(Duration::from_millis(MAXIMUM_SLEEP_SLICE));
            trace!("user {}: sleeping {:?}", self.id, slice);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
    }
}
impl fmt::Debug for VirtualUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VirtualUser")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("position", &self.tree.full_name(self.position()))
            .field("storage", &self.storage)
            .finish()
    }
}

/// Customizes how a virtual user starts and how long it thinks between tasks.
#[async_trait]
pub trait UserBehavior: Send + Sync {
    /// Invoked once when the user spawns, before it starts selecting tasks. Runs the
    /// entry node's function by default.
    async fn on_spawn(&self, user: &mut VirtualUser) {
        user.run_entry_task().await;
    }

    /// How long the user sleeps after each selection.
    fn think_time(&self, user: &VirtualUser) -> Duration {
        user.default_think_time()
    }
}

/// The behavior used when no [`UserFactory`] is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUser;
impl UserBehavior for DefaultUser {}

/// Creates the behavior for each virtual user as it spawns.
pub trait UserFactory: Send + Sync {
    fn create(&self, id: usize) -> Result<Arc<dyn UserBehavior>, LoadTestError>;
}

impl<F> UserFactory for F
where
    F: Fn(usize) -> Result<Arc<dyn UserBehavior>, LoadTestError> + Send + Sync,
{
    fn create(&self, id: usize) -> Result<Arc<dyn UserBehavior>, LoadTestError> {
        self(id)
    }
}

/// Creates a [`DefaultUser`] for every spawn.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUserFactory;
impl UserFactory for DefaultUserFactory {
    fn create(&self, _id: usize) -> Result<Arc<dyn UserBehavior>, LoadTestError> {
        Ok(Arc::new(DefaultUser))
    }
}

/// Extracts the message from a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// Marks the user stopped and removes it from the population when its run loop ends,
// including when the loop unwinds.
struct UserExit {
    id: usize,
    status: SharedUserStatus,
    population: Arc<Population>,
}
impl Drop for UserExit {
    fn drop(&mut self) {
        self.status.set(UserStatus::Stopped);
        self.population.remove(self.id);
        info!("exiting user {}...", self.id);
    }
}

/// The run loop of a single virtual user.
pub(crate) async fn user_main(
    mut user: VirtualUser,
    behavior: Arc<dyn UserBehavior>,
    stagger: Duration,
    population: Arc<Population>,
) {
    let id = user.id;
    let _exit = UserExit {
        id,
        status: user.shared_status(),
        population,
    };
    info!("launching user {}...", id);

    if !stagger.is_zero() {
        debug!("user {}: staggering start by {:?}", id, stagger);
        user.sleep(stagger).await;
    }

    if user.status() != UserStatus::Spawning {
        return;
    }
    if let Err(panic) = AssertUnwindSafe(behavior.on_spawn(&mut user))
        .catch_unwind()
        .await
    {
        error!(
            "user {}: panicked while spawning: {}",
            id,
            panic_message(panic.as_ref())
        );
        return;
    }

    // A stop requested while spawning wins.
    if !user.status.transition(UserStatus::Spawning, UserStatus::Running) {
        return;
    }
    debug!("user {}: running", id);
    let think_time = behavior.think_time(&user);
    user.sleep(think_time).await;

    while user.status() == UserStatus::Running {
        if let Err(e) = user.tick().await {
            error!("user {}: unable to select a task: {}", id, e);
            break;
        }
        if user.status() != UserStatus::Running {
            break;
        }
        let think_time = behavior.think_time(&user);
        user.sleep(think_time).await;
    }
}
