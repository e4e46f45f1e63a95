use crate::config::Config;
use crate::error::ProxyError;
use crate::handler::ForwardingHandler;
use crate::logging::Logger;
use crate::shutdown::{Shutdown, ShutdownReason};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// How long in-flight requests may run once shutdown begins.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    ShuttingDown,
    Stopped,
}

/// A bound listener plus everything needed to serve it.
///
/// Binding happens in [`ProxyServer::bind`], so a bad address fails before
/// anything is served. [`ProxyServer::serve`] runs the accept loop and the
/// shutdown waiter as two tasks and returns once both have settled.
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<ForwardingHandler>,
    logger: Logger,
    grace_period: Duration,
    state: Arc<watch::Sender<ServerState>>,
}

impl ProxyServer {
    pub async fn bind(
        config: &Config,
        handler: ForwardingHandler,
        logger: Logger,
    ) -> Result<Self, ProxyError> {
        let logger = logger.named("anyproxy::server");
        let (state, _) = watch::channel(ServerState::Starting);

        let addr = config.listen_addr();
        logger.info(format_args!("binding listener addr={}", addr));
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            handler: Arc::new(handler),
            logger,
            grace_period: DEFAULT_GRACE_PERIOD,
            state: Arc::new(state),
        })
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Serves until `shutdown` is cancelled or accepting fails.
    ///
    /// Returns `Ok` for an intentional stop once in-flight requests drained.
    /// A failed accept loop, or a drain that outlived the grace period, is
    /// reported as an error (several causes are combined into one).
    pub async fn serve(self, shutdown: Shutdown) -> Result<(), ProxyError> {
        let ProxyServer {
            listener,
            local_addr,
            handler,
            logger,
            grace_period,
            state,
        } = self;

        state.send_replace(ServerState::Serving);
        logger.info(format_args!("serving addr={}", local_addr));

        // Cancelled only when the grace period runs out.
        let force = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            listener,
            handler,
            shutdown.clone(),
            force.clone(),
            logger.clone(),
        ));
        let waiter = tokio::spawn(drain(
            accept,
            shutdown.clone(),
            force,
            grace_period,
            Arc::clone(&state),
            logger.clone(),
        ));

        let drained = match waiter.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Serve(format!("shutdown task failed: {}", e))),
        };

        let mut errors = Vec::new();
        if let Some(ShutdownReason::Failed(cause)) = shutdown.reason() {
            errors.push(ProxyError::Serve(cause));
        }
        if let Err(e) = drained {
            errors.push(e);
        }

        state.send_replace(ServerState::Stopped);
        let result = ProxyError::combine(errors);
        match &result {
            Ok(()) => logger.info(format_args!("server stopped addr={}", local_addr)),
            Err(e) => logger.error(format_args!(
                "server stopped with errors addr={} error={}",
                local_addr, e
            )),
        }
        result
    }
}

struct Connections {
    graceful: GracefulShutdown,
    tasks: JoinSet<()>,
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<ForwardingHandler>,
    shutdown: Shutdown,
    force: CancellationToken,
    logger: Logger,
) -> Connections {
    let graceful = GracefulShutdown::new();
    let mut tasks = JoinSet::new();

    loop {
        while tasks.try_join_next().is_some() {}

        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    logger.warn(format_args!("accept failed error={}", e));
                    continue;
                }
                Err(e) => {
                    logger.error(format_args!("accept loop failed error={}", e));
                    shutdown.cancel_with(ShutdownReason::Failed(format!("accept failed: {}", e)));
                    break;
                }
            },
        };

        let handler = Arc::clone(&handler);
        let force = force.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            let cancel = force.child_token();
            async move { Ok::<_, Infallible>(handler.handle(req, &cancel).await) }
        });

        let conn = http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(stream), service);
        let conn = graceful.watch(conn);

        let logger = logger.clone();
        tasks.spawn(async move {
            if let Err(e) = conn.await {
                logger.debug(format_args!("connection error remote={} error={}", remote, e));
            }
        });
    }

    drop(listener);
    Connections { graceful, tasks }
}

async fn drain(
    accept: JoinHandle<Connections>,
    shutdown: Shutdown,
    force: CancellationToken,
    grace_period: Duration,
    state: Arc<watch::Sender<ServerState>>,
    logger: Logger,
) -> Result<(), ProxyError> {
    shutdown.cancelled().await;
    state.send_replace(ServerState::ShuttingDown);
    logger.info(format_args!(
        "shutting down reason={} grace_period={:?}",
        shutdown.reason().unwrap_or(ShutdownReason::Stopped),
        grace_period
    ));

    let Connections {
        graceful,
        mut tasks,
    } = accept
        .await
        .map_err(|e| ProxyError::Serve(format!("accept task failed: {}", e)))?;

    match tokio::time::timeout(grace_period, graceful.shutdown()).await {
        Ok(()) => Ok(()),
        Err(_) => {
            logger.warn(format_args!(
                "grace period expired, terminating connections remaining={}",
                tasks.len()
            ));
            force.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            Err(ProxyError::ShutdownTimeout(grace_period))
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
