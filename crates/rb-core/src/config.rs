use rb_telemetry::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.runbox/config.toml`.
///
/// Credentials are never part of the config; they live on the `User` record
/// handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub runs: RunsConfig,
}

impl Config {
    /// Load config from `~/.runbox/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.docker.validate()?;
        self.timeouts.validate()?;
        self.runs.validate()?;
        Ok(())
    }

    /// Data directory with a leading `~/` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".runbox")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "human" or "json".
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "general.log_level must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == LogFormat::Json
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> String {
    "~/.runbox".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// `unix:///path/to/docker.sock` or `tcp://host:port`; local defaults when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl DockerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(endpoint) = &self.endpoint {
            validate_endpoint(endpoint)?;
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "docker.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Address part of a Docker endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointAddr<'a> {
    /// Absolute socket path.
    Unix(&'a str),
    /// `host[:port]`.
    Tcp(&'a str),
}

/// Parse `unix:///abs/path` or `tcp://host[:port]`. Surrounding whitespace
/// is ignored.
pub fn parse_endpoint(endpoint: &str) -> Option<EndpointAddr<'_>> {
    let endpoint = endpoint.trim();
    if let Some(path) = endpoint.strip_prefix("unix://") {
        path.starts_with('/').then_some(EndpointAddr::Unix(path))
    } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
        (!addr.is_empty() && !addr.starts_with(':')).then_some(EndpointAddr::Tcp(addr))
    } else {
        None
    }
}

pub fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    match parse_endpoint(endpoint) {
        Some(_) => Ok(()),
        None => Err(ConfigError::Validation(format!(
            "docker endpoint must be unix:///path or tcp://host:port, got \"{endpoint}\""
        ))),
    }
}

fn default_connect_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_setup_secs")]
    pub setup_secs: u64,
    #[serde(default = "default_mcp_secs")]
    pub mcp_secs: u64,
    #[serde(default = "default_git_secs")]
    pub git_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            setup_secs: default_setup_secs(),
            mcp_secs: default_mcp_secs(),
            git_secs: default_git_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("setup_secs", self.setup_secs),
            ("mcp_secs", self.mcp_secs),
            ("git_secs", self.git_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!(
                    "timeouts.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn setup(&self) -> Duration {
        Duration::from_secs(self.setup_secs)
    }

    pub fn mcp(&self) -> Duration {
        Duration::from_secs(self.mcp_secs)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
}

fn default_setup_secs() -> u64 {
    600
}
fn default_mcp_secs() -> u64 {
    60
}
fn default_git_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Frames of backtrace kept on a failed run's error step.
    #[serde(default = "default_backtrace_lines")]
    pub backtrace_lines: usize,
    #[serde(default = "default_redaction_marker")]
    pub redaction_marker: String,
    /// `{RUN_ID}` is replaced with the run id.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            backtrace_lines: default_backtrace_lines(),
            redaction_marker: default_redaction_marker(),
            commit_message: default_commit_message(),
        }
    }
}

impl RunsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redaction_marker.is_empty() {
            return Err(ConfigError::Validation(
                "runs.redaction_marker must not be empty".into(),
            ));
        }
        if self.commit_message.trim().is_empty() {
            return Err(ConfigError::Validation(
                "runs.commit_message must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn commit_message_for(&self, run_id: uuid::Uuid) -> String {
        self.commit_message.replace("{RUN_ID}", &run_id.to_string())
    }
}

fn default_backtrace_lines() -> usize {
    10
}
fn default_redaction_marker() -> String {
    "[FILTERED]".into()
}
fn default_commit_message() -> String {
    "Auto-commit from runbox run {RUN_ID}".into()
}
