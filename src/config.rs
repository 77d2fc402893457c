//! Server configuration parsed from command-line arguments.

use crate::buffer::DEFAULT_READ_HINT;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::thread;
use thiserror::Error;

/// Levels accepted by `--log-level`
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 picks a free port)
    pub port: u16,
    /// Number of io groups, each with its own reactor thread
    pub io_threads: usize,
    /// Bytes requested from the socket per read
    pub read_hint: usize,
    /// Set `TCP_NODELAY` on accepted sockets
    pub no_delay: bool,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            io_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            read_hint: DEFAULT_READ_HINT,
            no_delay: false,
            log_level: "info".to_string(),
        }
    }
}

/// What the binary should do after parsing its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(Config),
    Help,
    Version,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),
}

impl Config {
    /// Parses arguments, excluding the program name.
    pub fn parse<I, S>(args: I) -> Result<Command, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Config::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--host" | "-h" => {
                    config.host = required(&arg, args.next())?;
                }
                "--port" | "-p" => {
                    config.port = parse_number(&arg, args.next())?;
                }
                "--io-threads" => {
                    config.io_threads = parse_number(&arg, args.next())?;
                    if config.io_threads == 0 {
                        return Err(invalid(&arg, "0"));
                    }
                }
                "--read-hint" => {
                    config.read_hint = parse_number(&arg, args.next())?;
                    if config.read_hint == 0 {
                        return Err(invalid(&arg, "0"));
                    }
                }
                "--no-delay" => config.no_delay = true,
                "--log-level" => {
                    let level = required(&arg, args.next())?.to_lowercase();
                    if !LOG_LEVELS.contains(&level.as_str()) {
                        return Err(invalid(&arg, &level));
                    }
                    config.log_level = level;
                }
                "--help" => return Ok(Command::Help),
                "--version" | "-v" => return Ok(Command::Version),
                _ => return Err(ConfigError::UnknownArgument(arg)),
            }
        }

        Ok(Command::Run(config))
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn required(flag: &str, value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T, ConfigError> {
    let value = required(flag, value)?;
    value.parse().map_err(|_| invalid(flag, &value))
}

fn invalid(flag: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Config {
        match Config::parse(args.iter().copied()) {
            Ok(Command::Run(config)) => config,
            other => panic!("expected a run command, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = run(&[]);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.read_hint, DEFAULT_READ_HINT);
        assert!(config.io_threads >= 1);
        assert!(!config.no_delay);
        assert_eq!(config.bind_address(), format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT));
    }

    #[test]
    fn test_all_flags() {
        let config = run(&[
            "-h",
            "0.0.0.0",
            "--port",
            "8883",
            "--io-threads",
            "3",
            "--read-hint",
            "16384",
            "--no-delay",
            "--log-level",
            "DEBUG",
        ]);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8883);
        assert_eq!(config.io_threads, 3);
        assert_eq!(config.read_hint, 16384);
        assert!(config.no_delay);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(Config::parse(["--help"]), Ok(Command::Help));
        assert_eq!(Config::parse(["-p", "1", "-v"]), Ok(Command::Version));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            Config::parse(["--port"]),
            Err(ConfigError::MissingValue("--port".to_string()))
        );
        assert_eq!(
            Config::parse(["--port", "99999"]),
            Err(ConfigError::InvalidValue {
                flag: "--port".to_string(),
                value: "99999".to_string(),
            })
        );
        assert!(matches!(
            Config::parse(["--io-threads", "0"]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::parse(["--log-level", "loud"]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            Config::parse(["--bogus"]),
            Err(ConfigError::UnknownArgument("--bogus".to_string()))
        );
    }
}
