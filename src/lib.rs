//! # loadtree
//!
//! loadtree is a load testing framework that drives a population of virtual users
//! through a weighted tree of tasks.
//!
//! Load tests are built by creating an application with Cargo, and declaring a
//! dependency on the loadtree library. What a task actually does is up to the load
//! test author: each task is an async function that receives the
//! [`VirtualUser`](./user/struct.VirtualUser.html) running it and reports success or a
//! descriptive failure.
//!
//! ## Creating a load test
//!
//! A load test defines one entry node. Tasks and sections are registered under it,
//! forming a tree. Each time a virtual user wakes up it selects one node, stepping into
//! sections and back out of them, until it finds a task to run.
//!
//! ```rust,no_run
//! use loadtree::prelude::*;
//!
//! fn main() -> Result<(), LoadTestError> {
//!     LoadTest::initialize()?
//!         .register_entry(
//!             // The entry function runs once as each user spawns.
//!             task!(login)
//!                 .set_name("root")
//!                 .register_section("profile", |profile| {
//!                     profile
//!                         .set_step_out_weight(1)
//!                         .register_task(task!(view_profile).set_name("view").set_weight(10))
//!                         .register_task(task!(edit_profile).set_name("edit"))
//!                 }),
//!         )
//!         .execute()?;
//!
//!     Ok(())
//! }
//!
//! async fn login(user: &mut VirtualUser) -> TaskResult {
//!     user.storage.set("session", format!("session-{}", user.id));
//!     Ok(())
//! }
//!
//! async fn view_profile(user: &mut VirtualUser) -> TaskResult {
//!     let views = user.storage.get_int("views").unwrap_or(0);
//!     user.storage.set("views", views + 1);
//!     Ok(())
//! }
//!
//! async fn edit_profile(user: &mut VirtualUser) -> TaskResult {
//!     user.storage.get_string("session")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Running a load test
//!
//! Run-time options are parsed from the command line, see `--help` for all of them:
//!
//! ```bash
//! cargo run --release -- -u 100 -r 10 -t 5m --min-sleep 0 --max-sleep 2
//! ```
//!
//! Users are started at the configured spawn rate. Once all of them are running the
//! statistics are reset, so that the final report only covers the steady state. While
//! the test runs, a line-oriented controller listens on port 4141 by default and
//! accepts commands such as `users 50`, `metrics` and `shutdown`:
//!
//! ```bash
//! telnet localhost 4141
//! ```
//!
//! When the load test ends, per-task statistics are displayed:
//!
//! ```bash
//!  === PER TASK STATISTICS ===
//!  ------------------------------------------------------------------------------
//!  Name                     |   # times run |        # fails |    average | min/max
//!  ------------------------------------------------------------------------------
//!  root                     |            20 |         0 (0%) |     101.45 | 52/149
//!  root / profile / edit    |           991 |      12 (1.2%) |      70.12 | 20/119
//!  root / profile / view    |         9,894 |         0 (0%) |      22.30 | 5/39
//! ```
//!
//! ## License
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

#[macro_use]
pub mod task;

pub mod config;
pub mod controller;
pub mod population;
pub mod prelude;
pub mod selector;
pub mod statistics;
pub mod user;
pub mod util;

use gumdrop::Options;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::{fmt, io, time::Duration};
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{LoadTestConfiguration, LoadTestDefaults};
use crate::population::{Population, RECONCILE_INTERVAL};
use crate::selector::SelectionError;
use crate::statistics::{janitor_main, statistics_main, StatisticsEngine, StatisticsSnapshot};
use crate::task::{TaskNode, TaskTree};
use crate::user::{DefaultUserFactory, UserFactory};

/// The overall state of a load test, derived from the population and its target.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LoadTestStatus {
    /// No users exist and none are wanted.
    #[default]
    Stopped,
    /// Fewer users are running than wanted.
    Spawning,
    /// Exactly the wanted number of users are running.
    Running,
    /// Users are exiting, either because fewer are wanted or the test is ending.
    Stopping,
}

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum LoadTestError {
    /// Wraps a [`std::io::Error`].
    Io(io::Error),
    /// Wraps a [`tokio::task::JoinError`].
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`].
    Serialization(serde_json::Error),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid sleep time specified.
    InvalidSleepTime {
        /// The specified minimum sleep time.
        min_sleep: usize,
        /// The specified maximum sleep time.
        max_sleep: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// The task tree can never select a task.
    InvalidTaskTree {
        /// An optional explanation of the error.
        detail: String,
    },
    /// [`LoadTest`] has no entry node registered.
    NoEntryTask {
        /// An optional explanation of the error.
        detail: String,
    },
    /// The [`UserFactory`] failed to create a user.
    UserFactory {
        /// The id the user would have been assigned.
        id: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A controller client sent a command that isn't recognized.
    InvalidControllerCommand {
        /// An optional explanation of the error.
        detail: String,
    },
    /// Wraps a [`SelectionError`].
    Selection(SelectionError),
}
/// Implement a helper to provide a text description of all possible types of errors.
impl LoadTestError {
    fn describe(&self) -> &str {
        match *self {
            LoadTestError::Io(_) => "io::Error",
            LoadTestError::TokioJoin(_) => "tokio::task::JoinError",
            LoadTestError::Serialization(_) => "serde_json::Error",
            LoadTestError::InvalidOption { .. } => "invalid option or value specified",
            LoadTestError::InvalidSleepTime { .. } => "invalid sleep time specified",
            LoadTestError::InvalidTaskTree { .. } => "invalid task tree",
            LoadTestError::NoEntryTask { .. } => "no entry task defined",
            LoadTestError::UserFactory { .. } => "failed to create user",
            LoadTestError::InvalidControllerCommand { .. } => "invalid controller command",
            LoadTestError::Selection(_) => "failed to select a task",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for LoadTestError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LoadTestError::Io(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::TokioJoin(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::Serialization(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::Selection(ref source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::InvalidOption { ref detail, .. }
            | LoadTestError::InvalidSleepTime { ref detail, .. }
            | LoadTestError::InvalidTaskTree { ref detail }
            | LoadTestError::NoEntryTask { ref detail }
            | LoadTestError::UserFactory { ref detail, .. }
            | LoadTestError::InvalidControllerCommand { ref detail } => {
                write!(f, "LoadTestError: {} ({})", self.describe(), detail)
            }
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for LoadTestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            LoadTestError::Io(ref source) => Some(source),
            LoadTestError::TokioJoin(ref source) => Some(source),
            LoadTestError::Serialization(ref source) => Some(source),
            LoadTestError::Selection(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for LoadTestError {
    fn from(err: io::Error) -> LoadTestError {
        LoadTestError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for LoadTestError {
    fn from(err: tokio::task::JoinError) -> LoadTestError {
        LoadTestError::TokioJoin(err)
    }
}

/// Auto-convert serialization errors.
impl From<serde_json::Error> for LoadTestError {
    fn from(err: serde_json::Error) -> LoadTestError {
        LoadTestError::Serialization(err)
    }
}

/// Auto-convert selection errors.
impl From<SelectionError> for LoadTestError {
    fn from(err: SelectionError) -> LoadTestError {
        LoadTestError::Selection(err)
    }
}

/// A load test, built with a task tree and optional custom defaults, then executed.
pub struct LoadTest {
    /// Run-time options, parsed from the command line or provided directly.
    configuration: LoadTestConfiguration,
    /// Custom defaults, set with [`LoadTestDefaultType::set_default`](./config/trait.LoadTestDefaultType.html).
    pub(crate) defaults: LoadTestDefaults,
    /// The root of the task tree every user runs.
    entry: Option<TaskNode>,
    /// Creates the behavior of each user as it spawns.
    factory: Arc<dyn UserFactory>,
}
impl LoadTest {
    /// Load configuration from the command line and initialize a [`LoadTest`].
    ///
    /// # Example
    /// ```rust
    /// use loadtree::prelude::*;
    ///
    /// let mut load_test = LoadTest::initialize();
    /// ```
    pub fn initialize() -> Result<LoadTest, LoadTestError> {
        Ok(LoadTest::initialize_with_config(
            LoadTestConfiguration::parse_args_default_or_exit(),
        ))
    }

    /// Initialize a [`LoadTest`] with an already loaded configuration.
    ///
    /// This is generally used by tests.
    ///
    /// # Example
    /// ```rust
    /// use loadtree::LoadTest;
    /// use loadtree::config::LoadTestConfiguration;
    /// use gumdrop::Options;
    ///
    /// let configuration = LoadTestConfiguration::parse_args_default(&["-u", "3"]).unwrap();
    /// let load_test = LoadTest::initialize_with_config(configuration);
    /// ```
    pub fn initialize_with_config(configuration: LoadTestConfiguration) -> LoadTest {
        LoadTest {
            configuration,
            defaults: LoadTestDefaults::default(),
            entry: None,
            factory: Arc::new(DefaultUserFactory),
        }
    }

    /// Registers the entry node of the task tree. Registering again replaces the
    /// previous entry.
    pub fn register_entry(mut self, entry: TaskNode) -> Self {
        trace!("register_entry: {}", entry.name);
        if self.entry.is_some() {
            info!("replacing previously registered entry node");
        }
        self.entry = Some(entry);
        self
    }

    /// Replaces how users are created as they spawn.
    ///
    /// # Example
    /// ```rust
    /// use loadtree::prelude::*;
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// struct Impatient;
    /// impl UserBehavior for Impatient {
    ///     fn think_time(&self, _user: &VirtualUser) -> Duration {
    ///         Duration::from_millis(100)
    ///     }
    /// }
    ///
    /// let load_test = LoadTest::initialize_with_config(Default::default())
    ///     .set_user_factory(|_id: usize| -> Result<Arc<dyn UserBehavior>, LoadTestError> {
    ///         Ok(Arc::new(Impatient))
    ///     });
    /// ```
    pub fn set_user_factory<F: UserFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn configuration(&self) -> &LoadTestConfiguration {
        &self.configuration
    }

    // Applies custom defaults, validates the result and builds the task tree.
    fn prepare(&mut self) -> Result<TaskTree, LoadTestError> {
        self.configuration.configure(&self.defaults);
        self.configuration.validate()?;
        self.build_tree()
    }

    fn build_tree(&mut self) -> Result<TaskTree, LoadTestError> {
        let entry = self.entry.take().ok_or_else(|| LoadTestError::NoEntryTask {
            detail: "register an entry node with LoadTest::register_entry.".to_string(),
        })?;
        TaskTree::build(entry)
    }

    /// Starts the load test inside an already running tokio runtime, returning a handle
    /// for controlling it.
    ///
    /// Users begin spawning right away unless `--no-autostart` is set, in which case the
    /// test idles until [`LoadTestHandle::start`] or
    /// [`LoadTestHandle::set_target_population`] is called.
    pub async fn start(mut self) -> Result<LoadTestHandle, LoadTestError> {
        self.configuration.configure(&self.defaults);
        self.configuration.initialize_logger()?;
        self.configuration.validate()?;
        let tree = Arc::new(self.build_tree()?);
        debug!("task tree:\n{}", tree);

        let configuration = Arc::new(self.configuration);
        let statistics = Arc::new(StatisticsEngine::new());
        let (events_tx, events_rx) = flume::unbounded();
        let population = Arc::new(Population::new(
            tree,
            Arc::clone(&configuration),
            self.factory,
            Arc::clone(&statistics),
            events_tx,
        ));

        let handle = LoadTestHandle {
            state: Arc::new(RunState {
                configuration: Arc::clone(&configuration),
                statistics: Arc::clone(&statistics),
                population,
                wake: Notify::new(),
                run: Mutex::new(None),
            }),
        };

        let ingestion = tokio::spawn(statistics_main(events_rx, Arc::clone(&statistics)));
        let mut background = vec![tokio::spawn(janitor_main(Arc::clone(&statistics)))];

        if !configuration.no_controller {
            background.push(tokio::spawn(controller::controller_main(
                handle.clone(),
                configuration.controller_address(),
            )));
        }

        let run_time = configuration.run_time_seconds();
        if run_time > 0 {
            let timer_handle = handle.clone();
            background.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(run_time as u64)).await;
                info!("run time of {} seconds elapsed", run_time);
                timer_handle.shutdown();
            }));
        }

        if configuration.no_autostart {
            info!("waiting for a controller to start the load test");
        } else {
            handle.start();
        }

        let run = tokio::spawn(run_main(Arc::clone(&handle.state), ingestion, background));
        *handle.state.run.lock() = Some(run);
        Ok(handle)
    }

    /// Execute the load test, blocking until it ends. Returns the final statistics.
    ///
    /// `--version` and `--list` print their output and exit the process.
    pub fn execute(mut self) -> Result<StatisticsSnapshot, LoadTestError> {
        // If version flag is set, display package name and version and exit.
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        // Display the task tree, then exit.
        if self.configuration.list {
            let tree = self.prepare()?;
            println!("Task tree:\n{}", tree);
            std::process::exit(0);
        }

        let rt = Runtime::new()?;
        rt.block_on(async move {
            let handle = self.start().await?;
            util::setup_ctrlc_handler(handle.clone());
            handle.wait().await
        })
    }
}

// State shared by every handle on a running load test.
struct RunState {
    configuration: Arc<LoadTestConfiguration>,
    statistics: Arc<StatisticsEngine>,
    population: Arc<Population>,
    // Wakes the reconciliation loop early when the target changes.
    wake: Notify,
    run: Mutex<Option<JoinHandle<StatisticsSnapshot>>>,
}

/// Controls a running load test. Cheap to clone, and safe to use from any thread while
/// the test runs.
#[derive(Clone)]
pub struct LoadTestHandle {
    state: Arc<RunState>,
}
impl LoadTestHandle {
    /// Sets how many users should be running. Returns false once the load test is
    /// shutting down.
    pub fn set_target_population(&self, users: usize) -> bool {
        if !self.state.population.set_target(users) {
            warn!("load test is shutting down, ignoring target of {} users", users);
            return false;
        }
        self.state.wake.notify_one();
        true
    }

    /// Starts the configured number of users.
    pub fn start(&self) -> bool {
        self.set_target_population(self.state.configuration.users())
    }

    /// Stops all users, leaving the load test idle until it is started again.
    pub fn request_stop(&self) -> bool {
        self.set_target_population(0)
    }

    /// Stops all users, then ends the load test.
    pub fn shutdown(&self) {
        if self.state.population.shut_down() {
            info!("shutting down load test");
        }
        self.state.wake.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.population.is_shutting_down()
    }

    /// A consistent copy of the current statistics.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.state.statistics.snapshot()
    }

    /// The current statistics, serialized as JSON.
    pub fn snapshot_json(&self) -> Result<String, LoadTestError> {
        self.state.statistics.snapshot_json()
    }

    pub fn reset_statistics(&self) {
        self.state.statistics.reset();
    }

    pub fn configuration(&self) -> &LoadTestConfiguration {
        &self.state.configuration
    }

    /// The configuration, serialized as JSON.
    pub fn configuration_json(&self) -> Result<String, LoadTestError> {
        Ok(serde_json::to_string(&*self.state.configuration)?)
    }

    pub fn status(&self) -> LoadTestStatus {
        self.state.population.status()
    }

    /// How many users should be running.
    pub fn target(&self) -> usize {
        self.state.population.target()
    }

    /// How many users exist, including any that are still stopping.
    pub fn population(&self) -> usize {
        self.state.population.len()
    }

    /// Waits for the load test to end, returning the final statistics.
    ///
    /// Only the first caller waits on the run itself, later callers receive the
    /// statistics as they are when called.
    pub async fn wait(&self) -> Result<StatisticsSnapshot, LoadTestError> {
        let run = self.state.run.lock().take();
        match run {
            Some(run) => Ok(run.await?),
            None => Ok(self.snapshot()),
        }
    }
}

impl fmt::Debug for LoadTestHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoadTestHandle")
            .field("status", &self.status())
            .field("target", &self.target())
            .field("population", &self.population())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

// Reconciles the population until shutdown, then drains statistics and reports them.
async fn run_main(
    state: Arc<RunState>,
    ingestion: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
) -> StatisticsSnapshot {
    let mut drift_timer = tokio::time::Instant::now();
    loop {
        let status = state.population.reconcile();
        if status == LoadTestStatus::Stopped && state.population.is_shutting_down() {
            break;
        }

        tokio::select! {
            instant = util::sleep_minus_drift(RECONCILE_INTERVAL, drift_timer) => {
                drift_timer = instant;
            }
            _ = state.wake.notified() => {
                drift_timer = tokio::time::Instant::now();
            }
        }
    }

    // Every user has exited, so the channel closes once the population's sender drops.
    state.population.close_events();
    if let Err(e) = ingestion.await {
        warn!("statistics ingestion ended unexpectedly: {}", e);
    }
    for task in background {
        task.abort();
    }

    let snapshot = state.statistics.snapshot();
    if !state.configuration.no_print_statistics {
        println!("{}", snapshot);
    }
    info!("load test ended");
    snapshot
}
