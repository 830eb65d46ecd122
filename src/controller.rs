//! Optional line-oriented TCP controller.
//!
//! By default a controller listens on `0.0.0.0:4141`, allowing real-time control of the
//! running load test with any line-oriented client such as telnet:
//!
//! ```bash
//! $ telnet localhost 4141
//! loadtree> users 20
//! users configured
//! loadtree> status
//! status: spawning, users: 12, target: 20
//! ```
//!
//! Every connection is served by its own task, so any number of clients can connect
//! at once. Disable the controller with `--no-controller`.

use regex::{Regex, RegexSet};
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::{LoadTestError, LoadTestHandle};

/// Displayed after every response.
pub const PROMPT: &str = "loadtree> ";

/// All commands recognized by the controller.
///
/// Commands are not case sensitive. They are displayed in the help screen in the order
/// defined here.
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Displays a list of all commands supported by the controller.
    Help,
    /// Disconnects from the controller.
    Exit,
    /// Starts the configured number of users on an idle load test.
    Start,
    /// Stops all users, returning the load test to an idle state.
    Stop,
    /// Stops all users and ends the load test, disconnecting the controller.
    Shutdown,
    /// Sets how many users should be running, `users 100`.
    Users,
    /// Displays the status, population and target.
    Status,
    /// Displays the current statistics.
    Metrics,
    /// Displays the current statistics in json format.
    MetricsJson,
    /// Clears all statistics.
    Reset,
    /// Displays the load test configuration.
    Config,
    /// Displays the load test configuration in json format.
    ConfigJson,
}

// Each ControllerCommand defines its help text and the regex that matches it.
struct ControllerCommandDetails {
    name: &'static str,
    description: &'static str,
    regex: &'static str,
}

impl ControllerCommand {
    fn details(&self) -> ControllerCommandDetails {
        match self {
            ControllerCommand::Help => ControllerCommandDetails {
                name: "help",
                description: "this help\n",
                regex: r"(?i)^(help|\?)$",
            },
            ControllerCommand::Exit => ControllerCommandDetails {
                name: "exit",
                description: "exit controller\n\n",
                regex: r"(?i)^(exit|quit|q)$",
            },
            ControllerCommand::Start => ControllerCommandDetails {
                name: "start",
                description: "start an idle load test\n",
                regex: r"(?i)^start$",
            },
            ControllerCommand::Stop => ControllerCommandDetails {
                name: "stop",
                description: "stop all users and return to idle\n",
                regex: r"(?i)^stop$",
            },
            ControllerCommand::Shutdown => ControllerCommandDetails {
                name: "shutdown",
                description: "shutdown load test and exit controller\n\n",
                regex: r"(?i)^shutdown$",
            },
            ControllerCommand::Users => ControllerCommandDetails {
                name: "users INT",
                description: "set number of simulated users\n",
                regex: r"(?i)^(users?) (\d+)$",
            },
            ControllerCommand::Status => ControllerCommandDetails {
                name: "status",
                description: "display status, population and target\n\n",
                regex: r"(?i)^status$",
            },
            ControllerCommand::Metrics => ControllerCommandDetails {
                name: "metrics",
                description: "display statistics for current load test\n",
                regex: r"(?i)^(metrics|stats)$",
            },
            ControllerCommand::MetricsJson => ControllerCommandDetails {
                name: "metrics-json",
                description: "display statistics in json format\n",
                regex: r"(?i)^(metricsjson|metrics-json|statsjson|stats-json)$",
            },
            ControllerCommand::Reset => ControllerCommandDetails {
                name: "reset",
                description: "reset statistics\n\n",
                regex: r"(?i)^(reset|reset-metrics|reset-stats)$",
            },
            ControllerCommand::Config => ControllerCommandDetails {
                name: "config",
                description: "display load test configuration\n",
                regex: r"(?i)^config$",
            },
            ControllerCommand::ConfigJson => ControllerCommandDetails {
                name: "config-json",
                // No new-line as this is the last line of the help screen.
                description: "display load test configuration in json format",
                regex: r"(?i)^(configjson|config-json)$",
            },
        }
    }

    // Returns the value captured by the command's regex, if any.
    fn get_value(&self, command_string: &str) -> Option<String> {
        let regex = Regex::new(self.details().regex).ok()?;
        let caps = regex.captures(command_string)?;
        caps.get(2)
            .map(|m| m.as_str().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Builds the help screen displayed by the `help` command.
    pub fn display_help() -> String {
        let mut help_text = format!(
            "{} {} controller commands:\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        for command in ControllerCommand::iter() {
            let details = command.details();
            help_text.push_str(&format!("{:<18} {}", details.name, details.description));
        }
        help_text
    }
}

/// Convert controller input to a [`ControllerCommand`] with regular expressions.
impl FromStr for ControllerCommand {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let keys: Vec<ControllerCommand> = ControllerCommand::iter().collect();
        let commands = RegexSet::new(keys.iter().map(|command| command.details().regex))
            .map_err(|e| LoadTestError::InvalidControllerCommand {
                detail: format!("invalid controller regex: {}", e),
            })?;
        let matches: Vec<usize> = commands.matches(s).into_iter().collect();
        match matches.as_slice() {
            [] => Err(LoadTestError::InvalidControllerCommand {
                detail: format!("unrecognized controller command: '{}'.", s),
            }),
            [index] => Ok(keys[*index]),
            _ => Err(LoadTestError::InvalidControllerCommand {
                detail: format!(
                    "matched multiple controller commands: '{}' ({:?}).",
                    s,
                    matches.iter().map(|index| keys[*index]).collect::<Vec<_>>()
                ),
            }),
        }
    }
}

/// A parsed controller request: the command and its optional value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerRequest {
    pub command: ControllerCommand,
    pub value: Option<String>,
}
impl FromStr for ControllerRequest {
    type Err = LoadTestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = ControllerCommand::from_str(s)?;
        let value = command.get_value(s);
        Ok(ControllerRequest { command, value })
    }
}

/// Accepts controller connections on `address`, serving each one from its own task.
pub(crate) async fn controller_main(handle: LoadTestHandle, address: String) {
    debug!("preparing to bind controller to: {}", address);
    let listener = match TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind controller to {}: {}", address, e);
            return;
        }
    };
    info!("controller listening on: {}", address);

    // Counter increments each time a controller client connects.
    let mut client_id: u32 = 0;
    while let Ok((stream, _)) = listener.accept().await {
        client_id += 1;
        let peer_address = stream
            .peer_addr()
            .map_or("UNKNOWN ADDRESS".to_string(), |p| p.to_string());
        let state = ControllerState {
            client_id,
            peer_address,
            handle: handle.clone(),
        };
        let _ignored = tokio::spawn(state.accept_connection(stream));
    }
}

// Per-client controller state.
struct ControllerState {
    client_id: u32,
    peer_address: String,
    handle: LoadTestHandle,
}
impl ControllerState {
    async fn accept_connection(self, socket: TcpStream) {
        info!(
            "controller client [{}] connected from {}",
            self.client_id, self.peer_address
        );
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();

        write_to_socket(&mut writer, PROMPT).await;
        while let Ok(Some(line)) = lines.next_line().await {
            let command_string = line.trim();
            if command_string.is_empty() {
                write_to_socket(&mut writer, PROMPT).await;
                continue;
            }

            let (response, exit) = match ControllerRequest::from_str(command_string) {
                Ok(request) => {
                    info!(
                        "request from controller client {}: {:?}",
                        self.client_id, request
                    );
                    let exit = matches!(
                        request.command,
                        ControllerCommand::Exit | ControllerCommand::Shutdown
                    );
                    (self.execute_command(request), exit)
                }
                Err(_) => (Err("unrecognized command".to_string()), false),
            };
            let message = match response {
                Ok(message) => message,
                Err(e) => format!("error: {}", e),
            };
            write_to_socket(&mut writer, &[&message, "\n", PROMPT].concat()).await;
            if exit {
                break;
            }
        }
        info!(
            "controller client [{}] disconnected from {}",
            self.client_id, self.peer_address
        );
    }

    // Runs a command against the load test, returning the text to display.
    fn execute_command(&self, request: ControllerRequest) -> Result<String, String> {
        match request.command {
            ControllerCommand::Help => Ok(ControllerCommand::display_help()),
            ControllerCommand::Exit => Ok("goodbye!".to_string()),
            ControllerCommand::Start => {
                if self.handle.target() > 0 {
                    Err("load test already started".to_string())
                } else if self.handle.start() {
                    Ok("load test started".to_string())
                } else {
                    Err("load test is shutting down, failed to start".to_string())
                }
            }
            ControllerCommand::Stop => {
                if self.handle.target() == 0 {
                    Err("load test not running, failed to stop".to_string())
                } else if self.handle.request_stop() {
                    Ok("load test stopped".to_string())
                } else {
                    Err("load test is shutting down".to_string())
                }
            }
            ControllerCommand::Shutdown => {
                self.handle.shutdown();
                Ok("load test shut down".to_string())
            }
            ControllerCommand::Users => {
                let users = request
                    .value
                    .and_then(|value| value.parse::<usize>().ok())
                    .ok_or_else(|| "failed to parse number of users".to_string())?;
                if self.handle.set_target_population(users) {
                    Ok("users configured".to_string())
                } else {
                    Err("load test is shutting down, failed to reconfigure users".to_string())
                }
            }
            ControllerCommand::Status => Ok(format!(
                "status: {}, users: {}, target: {}",
                self.handle.status(),
                self.handle.population(),
                self.handle.target()
            )),
            ControllerCommand::Metrics => Ok(self.handle.snapshot().to_string()),
            ControllerCommand::MetricsJson => {
                self.handle.snapshot_json().map_err(|e| e.to_string())
            }
            ControllerCommand::Reset => {
                self.handle.reset_statistics();
                Ok("statistics reset".to_string())
            }
            ControllerCommand::Config => Ok(format!("{:#?}", self.handle.configuration())),
            ControllerCommand::ConfigJson => {
                self.handle.configuration_json().map_err(|e| e.to_string())
            }
        }
    }
}

async fn write_to_socket(writer: &mut OwnedWriteHalf, message: &str) {
    if writer.write_all(message.as_bytes()).await.is_err() {
        warn!("failed to write data to controller socket");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regexes_compile() {
        for command in ControllerCommand::iter() {
            assert!(Regex::new(command.details().regex).is_ok(), "{:?}", command);
        }
    }

    #[test]
    fn parse_commands() {
        let expected = [
            ("help", ControllerCommand::Help),
            ("?", ControllerCommand::Help),
            ("EXIT", ControllerCommand::Exit),
            ("quit", ControllerCommand::Exit),
            ("start", ControllerCommand::Start),
            ("Stop", ControllerCommand::Stop),
            ("shutdown", ControllerCommand::Shutdown),
            ("status", ControllerCommand::Status),
            ("stats", ControllerCommand::Metrics),
            ("metrics-json", ControllerCommand::MetricsJson),
            ("metricsjson", ControllerCommand::MetricsJson),
            ("reset", ControllerCommand::Reset),
            ("config", ControllerCommand::Config),
            ("Config-Json", ControllerCommand::ConfigJson),
        ];
        for (input, command) in expected {
            let request = ControllerRequest::from_str(input).unwrap();
            assert_eq!(request.command, command, "{}", input);
            assert_eq!(request.value, None);
        }
    }

    #[test]
    fn parse_users() {
        let request = ControllerRequest::from_str("users 25").unwrap();
        assert_eq!(request.command, ControllerCommand::Users);
        assert_eq!(request.value.as_deref(), Some("25"));

        let request = ControllerRequest::from_str("USER 0").unwrap();
        assert_eq!(request.value.as_deref(), Some("0"));

        assert!(ControllerRequest::from_str("users").is_err());
        assert!(ControllerRequest::from_str("users many").is_err());
        assert!(ControllerRequest::from_str("users -1").is_err());
    }

    #[test]
    fn unrecognized() {
        match ControllerCommand::from_str("fly") {
            Err(LoadTestError::InvalidControllerCommand { detail }) => {
                assert!(detail.contains("'fly'"));
            }
            other => panic!("expected InvalidControllerCommand, got {:?}", other),
        }
        assert!(ControllerCommand::from_str("start now").is_err());
    }

    #[test]
    fn help() {
        let help = ControllerCommand::display_help();
        assert!(help.starts_with("loadtree "));
        for command in ControllerCommand::iter() {
            assert!(help.contains(command.details().name));
        }
        assert!(!help.ends_with('\n'));
    }
}
