use crate::logging::Logger;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why the server stopped serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Stopped on purpose by the owner, or by a parent that gave no reason.
    Stopped,
    /// An OS interrupt or termination signal.
    Signal(&'static str),
    /// The server itself failed.
    Failed(String),
}

impl ShutdownReason {
    pub fn is_intentional(&self) -> bool {
        !matches!(self, ShutdownReason::Failed(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Stopped => write!(f, "stopped"),
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::Failed(cause) => write!(f, "failed: {}", cause),
        }
    }
}

/// Cancellation token that remembers the first reason it was cancelled with.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled together with `parent`. The child has its own reason slot.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Records `reason` unless one is already set, then cancels.
    pub fn cancel_with(&self, reason: ShutdownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn cancel(&self) {
        self.cancel_with(ShutdownReason::Stopped);
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// `None` while still running.
    pub fn reason(&self) -> Option<ShutdownReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(
            self.reason
                .get()
                .cloned()
                .unwrap_or(ShutdownReason::Stopped),
        )
    }
}

/// Cancels `shutdown` with [`ShutdownReason::Signal`] on SIGINT or SIGTERM
/// (Ctrl-C on non-unix targets). Returns once either a signal arrived or the
/// shutdown was triggered elsewhere.
pub async fn watch_signals(shutdown: Shutdown, logger: Logger) {
    let logger = logger.named("anyproxy::shutdown");
    tokio::select! {
        name = next_signal(&logger) => {
            logger.info(format_args!("shutdown signal received signal={}", name));
            shutdown.cancel_with(ShutdownReason::Signal(name));
        }
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(unix)]
async fn next_signal(logger: &Logger) -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            logger.warn(format_args!("cannot listen for SIGTERM error={}", e));
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                logger.warn(format_args!("cannot listen for SIGINT error={}", e));
                std::future::pending::<()>().await;
            }
            "SIGINT"
        }
        _ = async {
            match term.as_mut() {
                Some(stream) => { stream.recv().await; }
                None => std::future::pending::<()>().await,
            }
        } => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn next_signal(logger: &Logger) -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        logger.warn(format_args!("cannot listen for Ctrl-C error={}", e));
        std::future::pending::<()>().await;
    }
    "Ctrl-C"
}
