//! Configuration module for the vsock-exec server and client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::endpoint::{Endpoint, EndpointError};
use crate::executor::{DEFAULT_OUTPUT_CAPACITY, DEFAULT_SHELL};
use crate::protocol::DEFAULT_REQUEST_BUFFER;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "vsock-exec")]
#[command(author = "vsock-exec authors")]
#[command(version = "0.1.0")]
#[command(about = "One-shot remote command execution over vsock", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Endpoint to listen on (e.g., vsock://any:5555 or tcp://0.0.0.0:5555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to listen on, overriding the port of the listen endpoint
    #[arg(short = 'p', long)]
    pub port: Option<u32>,

    /// Shell used to interpret command lines
    #[arg(long)]
    pub shell: Option<PathBuf>,

    /// Maximum number of sessions served at once (1 = strictly sequential)
    #[arg(long)]
    pub max_sessions: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Mode>,
}

/// What the binary should do
#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the command server (default)
    Serve,
    /// Run one command on a remote server and exit with its exit code
    Run(RunArgs),
}

/// Arguments of the `run` client
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Endpoint of the server (e.g., vsock://103:5555)
    #[arg(long)]
    pub connect: Option<String>,

    /// Timeout in seconds for connecting and receiving
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Connection attempts before giving up
    #[arg(long)]
    pub retries: Option<u32>,

    /// Command line to execute remotely
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Endpoint to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Sessions served at once
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Command execution configuration
#[derive(Debug, Deserialize)]
pub struct ExecConfig {
    /// Shell used to interpret command lines
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    /// Size of the single request read
    #[serde(default = "default_request_buffer")]
    pub request_buffer: usize,
    /// Output buffer capacity (one byte is reserved)
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            request_buffer: default_request_buffer(),
            output_capacity: default_output_capacity(),
        }
    }
}

/// Client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    /// Endpoint the `run` client connects to
    #[serde(default = "default_connect")]
    pub connect: String,
    /// Timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Connection attempts
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            timeout: default_timeout(),
            retries: default_retries(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    Endpoint::default_listen().to_string()
}

fn default_backlog() -> i32 {
    5
}

fn default_max_sessions() -> usize {
    1
}

fn default_shell() -> PathBuf {
    PathBuf::from(DEFAULT_SHELL)
}

fn default_request_buffer() -> usize {
    DEFAULT_REQUEST_BUFFER
}

fn default_output_capacity() -> usize {
    DEFAULT_OUTPUT_CAPACITY
}

fn default_connect() -> String {
    "vsock://103:5555".to_string()
}

fn default_timeout() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved action of this invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Serve,
    Run { command: String },
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect: Endpoint,
    pub timeout: Duration,
    pub retries: u32,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub listen: Endpoint,
    pub backlog: i32,
    pub max_sessions: usize,
    pub shell: PathBuf,
    pub request_buffer: usize,
    pub output_capacity: usize,
    pub client: ClientSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::from_sources(cli, toml_config)
    }

    /// Merge parsed CLI args over a parsed TOML file.
    pub fn from_sources(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let mut listen: Endpoint = listen_str
            .parse()
            .map_err(|e| ConfigError::Endpoint(listen_str.clone(), e))?;
        if let Some(port) = cli.port {
            listen = listen
                .with_port(port)
                .map_err(|e| ConfigError::Endpoint(listen_str.clone(), e))?;
        }

        let (action, run) = match cli.command {
            None | Some(Mode::Serve) => (Action::Serve, None),
            Some(Mode::Run(args)) => (
                Action::Run {
                    command: args.command.join(" "),
                },
                Some((args.connect, args.timeout, args.retries)),
            ),
        };
        let (connect, timeout, retries) = run.unwrap_or((None, None, None));

        let connect_str = connect.unwrap_or(toml_config.client.connect);
        let connect: Endpoint = connect_str
            .parse()
            .map_err(|e| ConfigError::Endpoint(connect_str.clone(), e))?;

        let config = Config {
            action,
            listen,
            backlog: toml_config.server.backlog,
            max_sessions: cli
                .max_sessions
                .unwrap_or(toml_config.server.max_sessions),
            shell: cli.shell.unwrap_or(toml_config.exec.shell),
            request_buffer: toml_config.exec.request_buffer,
            output_capacity: toml_config.exec.output_capacity,
            client: ClientSettings {
                connect,
                timeout: Duration::from_secs(timeout.unwrap_or(toml_config.client.timeout)),
                retries: retries.unwrap_or(toml_config.client.retries),
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.request_buffer < 2 {
            return Err(ConfigError::Invalid("exec.request_buffer", "must be at least 2"));
        }
        if self.output_capacity < 2 {
            return Err(ConfigError::Invalid("exec.output_capacity", "must be at least 2"));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("server.max_sessions", "must be at least 1"));
        }
        if self.backlog < 1 {
            return Err(ConfigError::Invalid("server.backlog", "must be at least 1"));
        }
        if self.client.retries == 0 {
            return Err(ConfigError::Invalid("client.retries", "must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Endpoint(String, EndpointError),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Endpoint(s, e) => write!(f, "Invalid endpoint '{s}': {e}"),
            ConfigError::Invalid(field, reason) => write!(f, "Invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
