use hyper::{Method, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),

    #[error("Not found")]
    NotFound,

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Malformed request: {0}")]
    Request(String),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(String),

    #[error("Graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ProxyError>),
}

impl ProxyError {
    /// Status code reported to the caller when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::UnsupportedScheme(_) | ProxyError::InvalidTarget(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::AccessDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Collapses a list of lifecycle errors into a single result.
    pub fn combine(mut errors: Vec<ProxyError>) -> Result<(), ProxyError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ProxyError::Multiple(errors)),
        }
    }
}

fn join_errors(errors: &[ProxyError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The stage of an outbound attempt that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    ResponseHeader,
    Overall,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::ResponseHeader => write!(f, "response header"),
            TimeoutPhase::Overall => write!(f, "overall"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("filter out: {0}")]
    Filtered(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{phase} timeout after {after:?}")]
    Timeout { phase: TimeoutPhase, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("download failed after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u16,
        #[source]
        last: Box<DownloadError>,
    },

    #[error("download cancelled")]
    Cancelled,

    #[error("body error: {0}")]
    Body(#[from] hyper::Error),
}

impl DownloadError {
    /// Transport-level failures are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DownloadError::Transport(_) | DownloadError::Timeout { .. }
        )
    }
}
