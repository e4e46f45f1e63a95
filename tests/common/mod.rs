//! Shared fixtures for the integration tests: a capturing log sink, loopback
//! upstream servers and a small HTTP client.

#![allow(dead_code)]

use anyproxy::config::Config;
use anyproxy::logging::Logger;
use anyproxy::{ForwardingHandler, ProxyError, ProxyServer, Shutdown};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{Level, Log, Metadata, Record};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Log sink that keeps every record for later assertions.
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<(Level, String, String)>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logger(self: &Arc<Self>) -> Logger {
        Logger::new(Arc::clone(self) as Arc<dyn Log>)
    }

    pub fn messages(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, message)| message.clone())
            .collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }
}

impl Log for CaptureSink {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records.lock().unwrap().push((
            record.level(),
            record.target().to_string(),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

/// Canned upstream response.
#[derive(Clone)]
pub struct Canned {
    pub status: StatusCode,
    pub headers: Vec<(&'static str, &'static str)>,
    pub body: &'static str,
    pub delay: Duration,
}

impl Canned {
    pub fn ok(body: &'static str) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body,
            delay: Duration::ZERO,
        }
    }
}

/// Upstream that answers every request with `canned` and records the
/// request headers it saw.
pub struct Upstream {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<(String, HeaderMap)>>>,
    task: JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_upstream(canned: Canned) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&seen);
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let canned = canned.clone();
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let canned = canned.clone();
                    let recorded = Arc::clone(&recorded);
                    async move {
                        recorded
                            .lock()
                            .unwrap()
                            .push((req.uri().to_string(), req.headers().clone()));
                        if !canned.delay.is_zero() {
                            tokio::time::sleep(canned.delay).await;
                        }
                        let mut response = Response::new(Full::new(Bytes::from(canned.body)));
                        *response.status_mut() = canned.status;
                        for (name, value) in &canned.headers {
                            response
                                .headers_mut()
                                .insert(*name, value.parse().unwrap());
                        }
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream { addr, seen, task }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn loopback_config(allowance: &[&str]) -> Config {
    Config {
        listen: "127.0.0.1".to_string(),
        port: 0,
        allowance: allowance.iter().map(|s| s.to_string()).collect(),
        ..Config::default()
    }
}

/// A proxy serving on a loopback port in a background task.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), ProxyError>>,
}

pub async fn start_proxy(config: &Config, logger: Logger, grace_period: Duration) -> RunningProxy {
    let handler = ForwardingHandler::from_config(config, logger.clone()).unwrap();
    let server = ProxyServer::bind(config, handler, logger)
        .await
        .unwrap()
        .with_grace_period(grace_period);
    let addr = server.local_addr();
    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.serve(shutdown.clone()));
    RunningProxy {
        addr,
        shutdown,
        task,
    }
}

pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub fn client() -> Client<HttpConnector, Empty<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Sends `GET http://<proxy><path>` with extra headers and collects the body.
pub async fn get(proxy: SocketAddr, path: &str, headers: &[(&str, &str)]) -> Fetched {
    send(proxy, "GET", path, headers).await
}

pub async fn send(proxy: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> Fetched {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", proxy, path));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Empty::<Bytes>::new()).unwrap();

    let response = client().request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Fetched {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

/// Polls `condition` until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
