use crate::allowlist::Allowlist;
use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_attempt() -> u16 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProxyError::Config(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_targets")]
    pub targets: Vec<LogTarget>,
}

fn default_log_targets() -> Vec<LogTarget> {
    vec![LogTarget {
        output_type: LogOutputType::Stdout,
        path: None,
        level: None,
    }]
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            targets: default_log_targets(),
        }
    }
}

/// Outbound transport timeouts, in seconds. Zero selects the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake: u64,
    #[serde(default = "default_response_header_timeout")]
    pub response_header: u64,
    #[serde(default = "default_overall_timeout")]
    pub overall: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

fn default_response_header_timeout() -> u64 {
    30
}

fn default_overall_timeout() -> u64 {
    30
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            tls_handshake: default_tls_handshake_timeout(),
            response_header: default_response_header_timeout(),
            overall: default_overall_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        secs_or(self.connect, default_connect_timeout())
    }

    pub fn tls_handshake(&self) -> Duration {
        secs_or(self.tls_handshake, default_tls_handshake_timeout())
    }

    pub fn response_header(&self) -> Duration {
        secs_or(self.response_header, default_response_header_timeout())
    }

    pub fn overall(&self) -> Duration {
        secs_or(self.overall, default_overall_timeout())
    }
}

fn secs_or(value: u64, fallback: u64) -> Duration {
    Duration::from_secs(if value == 0 { fallback } else { value })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub allowance: Vec<String>,
    #[serde(default = "default_attempt")]
    pub attempt: u16,
    // Reserved: accepted for compatibility, never enforced.
    #[serde(default, rename = "rate-limit", skip_serializing_if = "String::is_empty")]
    pub rate_limit: String,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            allowance: Vec::new(),
            attempt: default_attempt(),
            rate_limit: String::new(),
            timeout: TimeoutConfig::default(),
            log: None,
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, ProxyError> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ProxyError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// `host:port` as handed to the listener.
    pub fn listen_addr(&self) -> String {
        if self.listen.contains(':') && !self.listen.starts_with('[') {
            format!("[{}]:{}", self.listen, self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }

    /// Number of download attempts; zero is treated as a single attempt.
    pub fn max_attempts(&self) -> u16 {
        self.attempt.max(1)
    }

    pub fn allowlist(&self) -> Result<Allowlist, ProxyError> {
        Allowlist::new(self.allowance.iter().cloned())
    }
}
