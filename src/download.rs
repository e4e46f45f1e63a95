//! Outbound fetching.
//!
//! A [`Downloader`] fetches a resource by URL and hands back status, headers
//! and a body stream. [`HttpDownloader`] is the hyper-based implementation:
//! it runs the optional URL filter before any I/O, enforces http/https,
//! bounds every attempt with transport timeouts and retries transport
//! failures according to its [`RetryPolicy`]. Non-2xx statuses are valid
//! responses and are never retried.

use crate::allowlist::Allowlist;
use crate::body::{DeadlineBody, ProxyBody};
use crate::config::TimeoutConfig;
use crate::error::{DownloadError, ProxyError, TimeoutPhase};
use crate::logging::Logger;
use crate::translate::{OutboundRequest, RequestTranslator};
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{HeaderMap, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pooled client shared by every request.
pub type HttpClient = Client<HandshakeTimeout<HttpsConnector<HttpConnector>>, Empty<Bytes>>;

/// Predicate that can veto a fetch before any network I/O happens.
pub trait UrlFilter: Send + Sync {
    fn allow(&self, request: &OutboundRequest) -> bool;
}

impl<F> UrlFilter for F
where
    F: Fn(&OutboundRequest) -> bool + Send + Sync,
{
    fn allow(&self, request: &OutboundRequest) -> bool {
        self(request)
    }
}

impl UrlFilter for Allowlist {
    fn allow(&self, request: &OutboundRequest) -> bool {
        self.permits(&request.host)
    }
}

/// A successful upstream response. The caller owns `body`; dropping it
/// releases the upstream connection.
pub struct DownloadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadResponse, DownloadError>;

    /// Fetches a raw address (https assumed when no scheme is given) and
    /// returns only the body stream.
    async fn download(
        &self,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<ProxyBody, DownloadError> {
        let target =
            RequestTranslator::normalize_address(address).map_err(|e| address_error(address, e))?;
        let request =
            OutboundRequest::get(&target, HeaderMap::new()).map_err(|e| address_error(address, e))?;
        Ok(self.fetch(request, cancel).await?.body)
    }
}

fn address_error(address: &str, err: ProxyError) -> DownloadError {
    match err {
        ProxyError::UnsupportedScheme(scheme) => DownloadError::UnsupportedScheme(scheme),
        other => DownloadError::InvalidAddress {
            address: address.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Delay inserted between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay(&self, failed_attempt: u16) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let shift = u32::from(failed_attempt.saturating_sub(1)).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub tls_handshake: Duration,
    pub response_header: Duration,
    pub overall: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            tls_handshake: Duration::from_secs(10),
            response_header: Duration::from_secs(30),
            overall: Duration::from_secs(30),
        }
    }
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: config.connect(),
            tls_handshake: config.tls_handshake(),
            response_header: config.response_header(),
            overall: config.overall(),
        }
    }
}

/// Connector wrapper bounding https connection establishment, TLS
/// handshake included.
#[derive(Clone)]
pub struct HandshakeTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> HandshakeTimeout<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> tower::Service<Uri> for HandshakeTimeout<C>
where
    C: tower::Service<Uri> + Clone + Send + 'static,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let is_tls = uri.scheme_str() == Some("https");
        let timeout = self.timeout;
        let connecting = self.inner.call(uri);

        Box::pin(async move {
            if !is_tls {
                return connecting.await.map_err(Into::into);
            }
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(format!("TLS handshake timeout after {:?}", timeout).into()),
            }
        })
    }
}

pub fn build_client(timeouts: &Timeouts) -> HttpClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(timeouts.connect));

    let https = HttpsConnector::new_with_connector(http);
    Client::builder(TokioExecutor::new()).build(HandshakeTimeout::new(https, timeouts.tls_handshake))
}

#[derive(Default)]
pub struct HttpDownloaderOptions {
    pub client: Option<HttpClient>,
    pub url_filter: Option<Arc<dyn UrlFilter>>,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub logger: Option<Logger>,
}

pub struct HttpDownloader {
    client: HttpClient,
    url_filter: Option<Arc<dyn UrlFilter>>,
    retry: RetryPolicy,
    response_header_timeout: Duration,
    overall_timeout: Duration,
    logger: Logger,
}

impl HttpDownloader {
    pub fn new(options: HttpDownloaderOptions) -> Self {
        let timeouts = options.timeouts;
        let client = options.client.unwrap_or_else(|| build_client(&timeouts));

        Self {
            client,
            url_filter: options.url_filter,
            retry: RetryPolicy::new(options.retry.max_attempts).with_backoff(options.retry.backoff),
            response_header_timeout: timeouts.response_header,
            overall_timeout: timeouts.overall,
            logger: options
                .logger
                .unwrap_or_else(Logger::discard)
                .named("anyproxy::download"),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn attempt(&self, request: &OutboundRequest) -> Result<DownloadResponse, DownloadError> {
        let deadline = Instant::now() + self.overall_timeout;

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let outbound = builder
            .body(Empty::<Bytes>::new())
            .map_err(|e| DownloadError::InvalidAddress {
                address: request.uri.to_string(),
                reason: e.to_string(),
            })?;

        let header_budget = self.response_header_timeout.min(self.overall_timeout);
        let response = match tokio::time::timeout(header_budget, self.client.request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(DownloadError::Transport(error_chain(&e))),
            Err(_) => {
                return Err(DownloadError::Timeout {
                    phase: TimeoutPhase::ResponseHeader,
                    after: header_budget,
                });
            }
        };

        let (parts, body) = response.into_parts();
        Ok(DownloadResponse {
            status: parts.status,
            headers: parts.headers,
            body: DeadlineBody::new(body, deadline, self.overall_timeout).boxed_unsync(),
        })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<DownloadResponse, DownloadError> {
        if let Some(filter) = &self.url_filter {
            if !filter.allow(&request) {
                return Err(DownloadError::Filtered(request.uri.to_string()));
            }
        }

        match request.url.scheme() {
            "http" | "https" => {}
            other => return Err(DownloadError::UnsupportedScheme(other.to_string())),
        }

        let max_attempts = self.retry.max_attempts;
        let mut attempt: u16 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                result = self.attempt(&request) => result,
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            self.logger.info(format_args!(
                "http download failed attempt={} max_attempts={} target={} error={}",
                attempt, max_attempts, request.uri, err
            ));

            if attempt >= max_attempts {
                return Err(DownloadError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.backoff.delay(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
