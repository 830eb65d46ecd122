//! Functions and structures related to configuring a load test.
//!
//! A load test can be configured at run time by passing in the options and flags defined
//! by the [`LoadTestConfiguration`] structure.
//!
//! A load test can be configured programmatically with [`LoadTestDefaultType::set_default`].

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;

use crate::util;
use crate::{LoadTest, LoadTestError};

/// The number of users started if not otherwise configured.
pub const DEFAULT_USERS: usize = 5;
/// The number of users spawned per second if not otherwise configured.
pub const DEFAULT_SPAWN_RATE: &str = "1";
/// Minimum seconds a user sleeps between tasks if not otherwise configured.
pub const DEFAULT_MIN_SLEEP: usize = 1;
/// Maximum seconds a user sleeps between tasks if not otherwise configured.
pub const DEFAULT_MAX_SLEEP: usize = 10;
/// Seconds before a request times out if not otherwise configured.
pub const DEFAULT_REQUEST_TIMEOUT: usize = 5;
/// The host the controller listens on if not otherwise configured.
pub const DEFAULT_CONTROLLER_HOST: &str = "0.0.0.0";
/// The port the controller listens on if not otherwise configured.
pub const DEFAULT_CONTROLLER_PORT: u16 = 4141;

/// Runtime options available when launching a load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`LoadTestDefaultType::set_default`].
///
/// Help is generated for all of these options by passing a `-h` flag to an application
/// built with this library, derived by [`gumdrop`](https://docs.rs/gumdrop/) from the
/// structure below.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"loadtree drives a population of virtual users through weighted task trees.

The following runtime options are available when launching a load test:"#
)]
pub struct LoadTestConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists the task tree and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists the task tree and exits\n")]
    pub list: bool,

    /// Sets concurrent users (default: 5)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user spawn rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub spawn_rate: Option<String>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Sets minimum seconds between tasks (default: 1)
    #[options(no_short, meta = "SECS")]
    pub min_sleep: Option<usize>,
    /// Sets maximum seconds between tasks (default: 10)
    #[options(no_short, meta = "SECS")]
    pub max_sleep: Option<usize>,
    /// Sets per-request timeout, in seconds (default: 5)
    #[options(no_short, meta = "SECS")]
    pub request_timeout: Option<usize>,
    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Statistics:' header after this option
        help = "Increases verbosity (-v, -vv, etc)\n\nStatistics:"
    )]
    pub verbose: u8,

    /// Doesn't reset statistics after all users have started
    #[options(no_short)]
    pub no_reset_statistics: bool,
    /// Doesn't display statistics at end of load test
    // Add a blank line and then an Advanced: header after this option
    #[options(
        no_short,
        help = "Doesn't display statistics at end of load test\n\nAdvanced:"
    )]
    pub no_print_statistics: bool,

    /// Doesn't automatically start load test
    #[options(no_short)]
    pub no_autostart: bool,
    /// Doesn't enable the controller
    #[options(no_short)]
    pub no_controller: bool,
    /// Sets controller host (default: 0.0.0.0)
    #[options(no_short, meta = "HOST")]
    pub controller_host: String,
    /// Sets controller TCP port (default: 4141)
    #[options(no_short, meta = "PORT")]
    pub controller_port: u16,
}

/// Optional default values for [`LoadTestConfiguration`] options, set with
/// [`LoadTestDefaultType::set_default`].
#[derive(Clone, Debug, Default)]
pub struct LoadTestDefaults {
    /// An optional default number of users to simulate.
    pub users: Option<usize>,
    /// An optional default number of users to spawn per second.
    pub spawn_rate: Option<String>,
    /// An optional default number of seconds for the test to run.
    pub run_time: Option<usize>,
    /// An optional default minimum number of seconds between tasks.
    pub min_sleep: Option<usize>,
    /// An optional default maximum number of seconds between tasks.
    pub max_sleep: Option<usize>,
    /// An optional default number of seconds to timeout requests.
    pub request_timeout: Option<usize>,
    /// An optional default log file name.
    pub log_file: Option<String>,
    /// An optional default log file level.
    pub log_level: Option<u8>,
    /// An optional default for how quiet to be.
    pub quiet: Option<u8>,
    /// An optional default for how verbose to be.
    pub verbose: Option<u8>,
    /// An optional default for not resetting statistics after all users started.
    pub no_reset_statistics: Option<bool>,
    /// An optional default for not displaying statistics at the end of the load test.
    pub no_print_statistics: Option<bool>,
    /// An optional default for not auto-starting the load test.
    pub no_autostart: Option<bool>,
    /// An optional default for not enabling the controller.
    pub no_controller: Option<bool>,
    /// An optional default for the host the controller listens on.
    pub controller_host: Option<String>,
    /// An optional default for the port the controller listens on.
    pub controller_port: Option<u16>,
}

/// Defines all [`LoadTestConfiguration`] options that can be programmatically
/// configured with a custom default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadTestDefault {
    /// An optional default number of users to simulate (usize).
    Users,
    /// An optional default number of users to spawn per second (&str).
    SpawnRate,
    /// An optional default number of seconds for the test to run (usize).
    RunTime,
    /// An optional default minimum number of seconds between tasks (usize).
    MinSleep,
    /// An optional default maximum number of seconds between tasks (usize).
    MaxSleep,
    /// An optional default number of seconds to timeout requests (usize).
    RequestTimeout,
    /// An optional default log file name (&str).
    LogFile,
    /// An optional default log file level (usize).
    LogLevel,
    /// An optional default for how quiet to be (usize).
    Quiet,
    /// An optional default for how verbose to be (usize).
    Verbose,
    /// An optional default for not resetting statistics (bool).
    NoResetStatistics,
    /// An optional default for not displaying statistics at the end (bool).
    NoPrintStatistics,
    /// An optional default for not auto-starting the load test (bool).
    NoAutoStart,
    /// An optional default for not enabling the controller (bool).
    NoController,
    /// An optional default host for the controller (&str).
    ControllerHost,
    /// An optional default port for the controller (usize).
    ControllerPort,
}
impl LoadTestDefault {
    // The type of value each default expects.
    fn expected_type(self) -> &'static str {
        match self {
            LoadTestDefault::SpawnRate
            | LoadTestDefault::LogFile
            | LoadTestDefault::ControllerHost => "&str",
            LoadTestDefault::Users
            | LoadTestDefault::RunTime
            | LoadTestDefault::MinSleep
            | LoadTestDefault::MaxSleep
            | LoadTestDefault::RequestTimeout
            | LoadTestDefault::LogLevel
            | LoadTestDefault::Quiet
            | LoadTestDefault::Verbose
            | LoadTestDefault::ControllerPort => "usize",
            LoadTestDefault::NoResetStatistics
            | LoadTestDefault::NoPrintStatistics
            | LoadTestDefault::NoAutoStart
            | LoadTestDefault::NoController => "bool",
        }
    }

    // A helpful and explicit error for a value of the wrong type.
    fn invalid_type<T: fmt::Display>(self, value: T, received: &str) -> LoadTestError {
        LoadTestError::InvalidOption {
            option: format!("LoadTestDefault::{:?}", self),
            value: value.to_string(),
            detail: format!(
                "set_default(LoadTestDefault::{:?}, {}) expected {} value, received {}",
                self,
                value,
                self.expected_type(),
                received
            ),
        }
    }

    // Log level counts are stored as u8.
    fn level(self, value: usize) -> Result<u8, LoadTestError> {
        u8::try_from(value).map_err(|_| LoadTestError::InvalidOption {
            option: format!("LoadTestDefault::{:?}", self),
            value: value.to_string(),
            detail: "log level counts must be between 0 and 255.".to_string(),
        })
    }
}

/// Sets a custom default for a [`LoadTestDefault`] option.
///
/// The following options can be configured with a `&str`:
///  - [`LoadTestDefault::SpawnRate`]
///  - [`LoadTestDefault::LogFile`]
///  - [`LoadTestDefault::ControllerHost`]
///
/// The following options can be configured with a `usize`:
///  - [`LoadTestDefault::Users`]
///  - [`LoadTestDefault::RunTime`]
///  - [`LoadTestDefault::MinSleep`]
///  - [`LoadTestDefault::MaxSleep`]
///  - [`LoadTestDefault::RequestTimeout`]
///  - [`LoadTestDefault::LogLevel`]
///  - [`LoadTestDefault::Quiet`]
///  - [`LoadTestDefault::Verbose`]
///  - [`LoadTestDefault::ControllerPort`]
///
/// The following options can be configured with a `bool`:
///  - [`LoadTestDefault::NoResetStatistics`]
///  - [`LoadTestDefault::NoPrintStatistics`]
///  - [`LoadTestDefault::NoAutoStart`]
///  - [`LoadTestDefault::NoController`]
pub trait LoadTestDefaultType<T> {
    /// Sets a [`LoadTestDefault`] to the provided value.
    ///
    /// # Example
    /// ```rust
    /// use loadtree::prelude::*;
    ///
    /// fn main() -> Result<(), LoadTestError> {
    ///     LoadTest::initialize()?
    ///         // Do not reset the statistics after all users have started.
    ///         .set_default(LoadTestDefault::NoResetStatistics, true)?
    ///         // Sleep at most 3 seconds between tasks.
    ///         .set_default(LoadTestDefault::MaxSleep, 3)?
    ///         // Log to `loadtree.log`.
    ///         .set_default(LoadTestDefault::LogFile, "loadtree.log")?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: LoadTestDefault, value: T) -> Result<Self, LoadTestError>
    where
        Self: Sized;
}
impl LoadTestDefaultType<&str> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`&str`] value.
    fn set_default(mut self, key: LoadTestDefault, value: &str) -> Result<Self, LoadTestError> {
        match key {
            LoadTestDefault::SpawnRate => self.defaults.spawn_rate = Some(value.to_string()),
            LoadTestDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            LoadTestDefault::ControllerHost => {
                self.defaults.controller_host = Some(value.to_string())
            }
            _ => return Err(key.invalid_type(value, "&str")),
        }
        Ok(self)
    }
}
impl LoadTestDefaultType<usize> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`usize`] value.
    fn set_default(mut self, key: LoadTestDefault, value: usize) -> Result<Self, LoadTestError> {
        match key {
            LoadTestDefault::Users => self.defaults.users = Some(value),
            LoadTestDefault::RunTime => self.defaults.run_time = Some(value),
            LoadTestDefault::MinSleep => self.defaults.min_sleep = Some(value),
            LoadTestDefault::MaxSleep => self.defaults.max_sleep = Some(value),
            LoadTestDefault::RequestTimeout => self.defaults.request_timeout = Some(value),
            LoadTestDefault::LogLevel => self.defaults.log_level = Some(key.level(value)?),
            LoadTestDefault::Quiet => self.defaults.quiet = Some(key.level(value)?),
            LoadTestDefault::Verbose => self.defaults.verbose = Some(key.level(value)?),
            LoadTestDefault::ControllerPort => {
                let port = u16::try_from(value).map_err(|_| LoadTestError::InvalidOption {
                    option: "LoadTestDefault::ControllerPort".to_string(),
                    value: value.to_string(),
                    detail: "controller port must be between 0 and 65535.".to_string(),
                })?;
                self.defaults.controller_port = Some(port)
            }
            _ => return Err(key.invalid_type(value, "usize")),
        }
        Ok(self)
    }
}
impl LoadTestDefaultType<bool> for LoadTest {
    /// Sets [`LoadTestDefault`] to a [`bool`] value.
    fn set_default(mut self, key: LoadTestDefault, value: bool) -> Result<Self, LoadTestError> {
        match key {
            LoadTestDefault::NoResetStatistics => self.defaults.no_reset_statistics = Some(value),
            LoadTestDefault::NoPrintStatistics => self.defaults.no_print_statistics = Some(value),
            LoadTestDefault::NoAutoStart => self.defaults.no_autostart = Some(value),
            LoadTestDefault::NoController => self.defaults.no_controller = Some(value),
            _ => return Err(key.invalid_type(value, "bool")),
        }
        Ok(self)
    }
}

/// Used internally to configure [`LoadTestConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct ConfigValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait Configure<T> {
    /// Returns the first unfiltered [`ConfigValue`] that is set.
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T>;
}
impl<T: fmt::Debug> Configure<T> for LoadTestConfiguration {
    fn get_value(&self, values: Vec<ConfigValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                }
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

impl LoadTestConfiguration {
    /// Implement precedence rules for all [`LoadTestConfiguration`] values: options set
    /// at run time win, then custom defaults, then built-in defaults.
    pub fn configure(&mut self, defaults: &LoadTestDefaults) {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                ConfigValue {
                    value: defaults.quiet,
                    filter: defaults.quiet.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                ConfigValue {
                    value: defaults.verbose,
                    filter: defaults.verbose.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                ConfigValue {
                    value: defaults.log_level,
                    filter: defaults.log_level.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);

        // Configure `log_file`.
        self.log_file = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.log_file.to_string()),
                    filter: self.log_file.is_empty(),
                    message: "",
                },
                ConfigValue {
                    value: defaults.log_file.clone(),
                    filter: defaults.log_file.is_none(),
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Configure `users`.
        self.users = Some(
            self.get_value(vec![
                ConfigValue {
                    value: self.users,
                    filter: false,
                    message: "users",
                },
                ConfigValue {
                    value: defaults.users,
                    filter: false,
                    message: "users",
                },
            ])
            .unwrap_or(DEFAULT_USERS),
        );

        // Configure `spawn_rate`.
        self.spawn_rate = Some(
            self.get_value(vec![
                ConfigValue {
                    value: self.spawn_rate.clone(),
                    filter: false,
                    message: "spawn_rate",
                },
                ConfigValue {
                    value: defaults.spawn_rate.clone(),
                    filter: false,
                    message: "spawn_rate",
                },
            ])
            .unwrap_or_else(|| DEFAULT_SPAWN_RATE.to_string()),
        );

        // Configure `run_time`, stored as a time span.
        self.run_time = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.run_time.clone()),
                    filter: self.run_time.is_empty(),
                    message: "run_time",
                },
                ConfigValue {
                    value: defaults.run_time.map(|seconds| seconds.to_string()),
                    filter: defaults.run_time.is_none(),
                    message: "run_time",
                },
            ])
            .unwrap_or_default();

        // Configure `min_sleep`.
        self.min_sleep = Some(
            self.get_value(vec![
                ConfigValue {
                    value: self.min_sleep,
                    filter: false,
                    message: "min_sleep",
                },
                ConfigValue {
                    value: defaults.min_sleep,
                    filter: false,
                    message: "min_sleep",
                },
            ])
            .unwrap_or(DEFAULT_MIN_SLEEP),
        );

        // Configure `max_sleep`.
        self.max_sleep = Some(
            self.get_value(vec![
                ConfigValue {
                    value: self.max_sleep,
                    filter: false,
                    message: "max_sleep",
                },
                ConfigValue {
                    value: defaults.max_sleep,
                    filter: false,
                    message: "max_sleep",
                },
            ])
            .unwrap_or(DEFAULT_MAX_SLEEP),
        );

        // Configure `request_timeout`.
        self.request_timeout = Some(
            self.get_value(vec![
                ConfigValue {
                    value: self.request_timeout,
                    filter: false,
                    message: "request_timeout",
                },
                ConfigValue {
                    value: defaults.request_timeout,
                    filter: false,
                    message: "request_timeout",
                },
            ])
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        );

        // Configure boolean flags.
        self.no_reset_statistics = self
            .get_value(vec![
                ConfigValue {
                    value: Some(true),
                    filter: !self.no_reset_statistics,
                    message: "no_reset_statistics",
                },
                ConfigValue {
                    value: defaults.no_reset_statistics,
                    filter: false,
                    message: "no_reset_statistics",
                },
            ])
            .unwrap_or(false);
        self.no_print_statistics = self
            .get_value(vec![
                ConfigValue {
                    value: Some(true),
                    filter: !self.no_print_statistics,
                    message: "no_print_statistics",
                },
                ConfigValue {
                    value: defaults.no_print_statistics,
                    filter: false,
                    message: "no_print_statistics",
                },
            ])
            .unwrap_or(false);
        self.no_autostart = self
            .get_value(vec![
                ConfigValue {
                    value: Some(true),
                    filter: !self.no_autostart,
                    message: "no_autostart",
                },
                ConfigValue {
                    value: defaults.no_autostart,
                    filter: false,
                    message: "no_autostart",
                },
            ])
            .unwrap_or(false);
        self.no_controller = self
            .get_value(vec![
                ConfigValue {
                    value: Some(true),
                    filter: !self.no_controller,
                    message: "no_controller",
                },
                ConfigValue {
                    value: defaults.no_controller,
                    filter: false,
                    message: "no_controller",
                },
            ])
            .unwrap_or(false);

        // Configure the controller address.
        self.controller_host = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.controller_host.clone()),
                    filter: self.controller_host.is_empty(),
                    message: "controller_host",
                },
                ConfigValue {
                    value: defaults.controller_host.clone(),
                    filter: false,
                    message: "controller_host",
                },
            ])
            .unwrap_or_else(|| DEFAULT_CONTROLLER_HOST.to_string());
        self.controller_port = self
            .get_value(vec![
                ConfigValue {
                    value: Some(self.controller_port),
                    filter: self.controller_port == 0,
                    message: "controller_port",
                },
                ConfigValue {
                    value: defaults.controller_port,
                    filter: false,
                    message: "controller_port",
                },
            ])
            .unwrap_or(DEFAULT_CONTROLLER_PORT);
    }

    /// Validate configured [`LoadTestConfiguration`] values.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // Spawn rate must be a number greater than zero.
        if let Some(spawn_rate) = self.spawn_rate.as_ref() {
            match util::parse_spawn_rate(spawn_rate) {
                Some(_) => (),
                None => {
                    return Err(LoadTestError::InvalidOption {
                        option: "`configuration.spawn_rate`".to_string(),
                        value: spawn_rate.to_string(),
                        detail: "`configuration.spawn_rate` must be a number greater than 0."
                            .to_string(),
                    });
                }
            }
        }

        // Users can only be 0 if the load test doesn't start automatically.
        if self.users() == 0 && !self.no_autostart {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.users`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.users` must be set to at least 1 unless `configuration.no_autostart` is set.".to_string(),
            });
        }

        // Can't sleep less than the minimum.
        if self.min_sleep() > self.max_sleep() {
            return Err(LoadTestError::InvalidSleepTime {
                min_sleep: self.min_sleep(),
                max_sleep: self.max_sleep(),
                detail: "`configuration.min_sleep` can not be greater than `configuration.max_sleep`."
                    .to_string(),
            });
        }

        // Requests need time to complete.
        if self.request_timeout() == 0 {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.request_timeout`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.request_timeout` must be greater than 0.".to_string(),
            });
        }

        // A run time that doesn't parse would silently never stop the test.
        if !self.run_time.is_empty() && self.run_time_seconds() == 0 && self.run_time != "0" {
            return Err(LoadTestError::InvalidOption {
                option: "`configuration.run_time`".to_string(),
                value: self.run_time.clone(),
                detail: "`configuration.run_time` must be a time span such as 30s or 1h30m."
                    .to_string(),
            });
        }

        Ok(())
    }

    /// The number of users to start with.
    pub fn users(&self) -> usize {
        self.users.unwrap_or(DEFAULT_USERS)
    }

    /// The number of users to spawn per second.
    pub fn spawn_rate(&self) -> f32 {
        self.spawn_rate
            .as_deref()
            .and_then(util::parse_spawn_rate)
            .unwrap_or(1.0)
    }

    /// How many seconds the load test runs before stopping, 0 to run until stopped.
    pub fn run_time_seconds(&self) -> usize {
        util::parse_timespan(&self.run_time)
    }

    pub fn min_sleep(&self) -> usize {
        self.min_sleep.unwrap_or(DEFAULT_MIN_SLEEP)
    }

    pub fn max_sleep(&self) -> usize {
        self.max_sleep.unwrap_or(DEFAULT_MAX_SLEEP)
    }

    pub fn request_timeout(&self) -> usize {
        self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT)
    }

    /// The address the controller listens on.
    pub fn controller_address(&self) -> String {
        let host = if self.controller_host.is_empty() {
            DEFAULT_CONTROLLER_HOST
        } else {
            &self.controller_host
        };
        let port = if self.controller_port == 0 {
            DEFAULT_CONTROLLER_PORT
        } else {
            self.controller_port
        };
        format!("{}:{}", host, port)
    }

    /// Configures the logger, writing to the log file if one is configured.
    pub(crate) fn initialize_logger(&self) -> Result<(), LoadTestError> {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        if let Some(log_to_file) = log_file {
            let file = std::fs::File::create(&log_to_file)?;
            match CombinedLogger::init(vec![
                SimpleLogger::new(debug_level, Config::default()),
                WriteLogger::new(log_level, Config::default(), file),
            ]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
            info!("Writing to log file: {}", log_to_file.display());
        } else {
            match CombinedLogger::init(vec![SimpleLogger::new(debug_level, Config::default())]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
        Ok(())
    }
}
