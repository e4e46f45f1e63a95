use crate::allowlist::Allowlist;
use crate::body::ProxyBody;
use crate::config::Config;
use crate::download::{Downloader, HttpDownloader, HttpDownloaderOptions, RetryPolicy, Timeouts};
use crate::error::ProxyError;
use crate::logging::Logger;
use crate::response::ResponseBuilder;
use crate::translate::RequestTranslator;
use http_body_util::BodyExt;
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point for every inbound request.
///
/// Checks the method, resolves the target, enforces the allowlist, fetches
/// through the downloader and relays the upstream response unchanged.
/// Failures never escape a single request: each one becomes a response.
#[derive(Clone)]
pub struct ForwardingHandler {
    allowlist: Arc<Allowlist>,
    downloader: Arc<dyn Downloader>,
    logger: Logger,
}

impl ForwardingHandler {
    pub fn new(allowlist: Arc<Allowlist>, downloader: Arc<dyn Downloader>, logger: Logger) -> Self {
        Self {
            allowlist,
            downloader,
            logger: logger.named("anyproxy::handler"),
        }
    }

    /// Handler backed by an [`HttpDownloader`] configured from `config`.
    pub fn from_config(config: &Config, logger: Logger) -> Result<Self, ProxyError> {
        let allowlist = Arc::new(config.allowlist()?);
        let downloader = HttpDownloader::new(HttpDownloaderOptions {
            retry: RetryPolicy::new(config.max_attempts()),
            timeouts: Timeouts::from(&config.timeout),
            logger: Some(logger.clone()),
            ..HttpDownloaderOptions::default()
        });
        Ok(Self::new(allowlist, Arc::new(downloader), logger))
    }

    pub async fn handle<B>(&self, req: Request<B>, cancel: &CancellationToken) -> Response<ProxyBody> {
        let (parts, _) = req.into_parts();
        self.logger.info(format_args!(
            "request target={} method={}",
            parts.uri, parts.method
        ));

        match self.forward(&parts, cancel).await {
            Ok(response) => response,
            Err(err) => {
                self.logger.info(format_args!(
                    "request failed target={} status={} error={}",
                    parts.uri,
                    err.status_code().as_u16(),
                    err
                ));
                ResponseBuilder::from_error(&err)
            }
        }
    }

    async fn forward(
        &self,
        parts: &http::request::Parts,
        cancel: &CancellationToken,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if parts.method != Method::GET {
            return Err(ProxyError::MethodNotAllowed(parts.method.clone()));
        }

        let address = RequestTranslator::extract_target(&parts.uri)?;
        let target = RequestTranslator::normalize_address(&address)?;
        if !self.allowlist.permits(target.host()) {
            return Err(ProxyError::AccessDenied(target.host().to_string()));
        }

        let outbound = RequestTranslator::outbound(&target, &parts.headers)?;
        self.logger.debug(format_args!(
            "forwarding target={} headers={}",
            target,
            outbound.headers.len()
        ));
        let downloaded = self.downloader.fetch(outbound, cancel).await?;

        // Status is already on the wire by the time the body fails.
        let logger = self.logger.clone();
        let relay_target = target.to_string();
        let body = downloaded
            .body
            .map_err(move |err| {
                logger.warn(format_args!(
                    "relay failed target={} error={}",
                    relay_target, err
                ));
                err
            })
            .boxed_unsync();

        let mut response = Response::new(body);
        *response.status_mut() = downloaded.status;
        *response.headers_mut() = downloaded.headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use crate::download::DownloadResponse;
    use crate::error::DownloadError;
    use crate::translate::OutboundRequest;
    use async_trait::async_trait;
    use http_body_util::Empty;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE, COOKIE, ETAG, USER_AGENT};
    use hyper::{HeaderMap, StatusCode};
    use std::sync::Mutex;

    enum Reply {
        Ok(StatusCode, HeaderMap, &'static str),
        Fail(fn() -> DownloadError),
    }

    struct MockDownloader {
        reply: Reply,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl MockDownloader {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<OutboundRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Downloader for MockDownloader {
        async fn fetch(
            &self,
            request: OutboundRequest,
            _cancel: &CancellationToken,
        ) -> Result<DownloadResponse, DownloadError> {
            self.seen.lock().unwrap().push(request);
            match &self.reply {
                Reply::Ok(status, headers, payload) => Ok(DownloadResponse {
                    status: *status,
                    headers: headers.clone(),
                    body: body::full(*payload),
                }),
                Reply::Fail(make) => Err(make()),
            }
        }
    }

    fn handler(hosts: &[&str], downloader: Arc<MockDownloader>) -> ForwardingHandler {
        let allowlist = Arc::new(Allowlist::new(hosts.iter().copied()).unwrap());
        ForwardingHandler::new(allowlist, downloader, Logger::discard())
    }

    fn get(uri: &str) -> Request<Empty<Bytes>> {
        Request::builder().uri(uri).body(Empty::new()).unwrap()
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn ok_reply() -> Reply {
        Reply::Ok(StatusCode::OK, HeaderMap::new(), "")
    }

    #[tokio::test]
    async fn test_permitted_request_is_relayed() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));
        headers.insert("x-upstream-only", HeaderValue::from_static("kept"));
        let downloader = MockDownloader::new(Reply::Ok(StatusCode::OK, headers, "{\"a\":1}"));
        let handler = handler(&["example.org"], downloader.clone());

        let response = handler
            .handle(get("/example.org/data"), &CancellationToken::new())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().len(), 3);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(response.headers().get("x-upstream-only").unwrap(), "kept");
        assert_eq!(body_string(response).await, "{\"a\":1}");

        let calls = downloader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url.as_str(), "https://example.org/data");
        assert_eq!(calls[0].method, Method::GET);
    }

    #[tokio::test]
    async fn test_non_2xx_status_relayed_verbatim() {
        let downloader =
            MockDownloader::new(Reply::Ok(StatusCode::NOT_MODIFIED, HeaderMap::new(), ""));
        let handler = handler(&["example.org"], downloader);

        let response = handler
            .handle(get("/example.org/cached"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_denied_host_gets_403_without_fetch() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let response = handler
            .handle(get("/evil.test/x"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, "Access denied");
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_port_does_not_affect_allowlist() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let response = handler
            .handle(get("/http://good.test:8080/x"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(downloader.calls()[0].url.as_str(), "http://good.test:8080/x");
    }

    #[tokio::test]
    async fn test_mixed_case_entry_matches_host_as_written() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["Mixed.Test"], downloader.clone());

        let response = handler
            .handle(get("/Mixed.Test/x"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let calls = downloader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].host, "Mixed.Test");
        assert_eq!(calls[0].uri, "https://Mixed.Test/x");
    }

    #[tokio::test]
    async fn test_host_case_differs_from_entry_is_403() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let response = handler
            .handle(get("/GOOD.TEST/x"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dot_segments_reach_upstream_unresolved() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["example.org"], downloader.clone());

        let response = handler
            .handle(get("/example.org/a/../secret"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(downloader.calls()[0].uri, "https://example.org/a/../secret");
    }

    #[tokio::test]
    async fn test_non_get_is_405() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
            let req = Request::builder()
                .method(method.clone())
                .uri("/good.test/x")
                .body(Empty::<Bytes>::new())
                .unwrap();
            let response = handler.handle(req, &CancellationToken::new()).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{}", method);
            assert_eq!(response.headers().get(ALLOW).unwrap(), "GET");
        }
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_root_is_404() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let response = handler.handle(get("/"), &CancellationToken::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_400() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let response = handler
            .handle(get("/ftp://good.test/file"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(downloader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_is_500_with_cause() {
        let downloader = MockDownloader::new(Reply::Fail(|| DownloadError::Exhausted {
            attempts: 3,
            last: Box::new(DownloadError::Transport("connection refused".to_string())),
        }));
        let handler = handler(&["good.test"], downloader);

        let response = handler
            .handle(get("/good.test/x"), &CancellationToken::new())
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = body_string(response).await;
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_only_forwardable_headers_reach_downloader() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        let req = Request::builder()
            .uri("/good.test/x?page=2")
            .header(USER_AGENT, "test-agent")
            .header(COOKIE, "session=abc")
            .header("x-internal-token", "secret")
            .header("host", "proxy.local")
            .body(Empty::<Bytes>::new())
            .unwrap();
        handler.handle(req, &CancellationToken::new()).await;

        let calls = downloader.calls();
        let outbound = &calls[0];
        assert_eq!(outbound.url.as_str(), "https://good.test/x?page=2");
        assert_eq!(outbound.headers.len(), 2);
        assert_eq!(outbound.headers.get(USER_AGENT).unwrap(), "test-agent");
        assert_eq!(outbound.headers.get(COOKIE).unwrap(), "session=abc");
        assert!(outbound.headers.get("x-internal-token").is_none());
    }

    #[tokio::test]
    async fn test_repeated_requests_leave_allowlist_intact() {
        let downloader = MockDownloader::new(ok_reply());
        let handler = handler(&["good.test"], downloader.clone());

        for _ in 0..2 {
            let response = handler
                .handle(get("/good.test/x"), &CancellationToken::new())
                .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(handler.allowlist.len(), 1);
        assert!(handler.allowlist.permits("good.test"));
        assert_eq!(downloader.calls().len(), 2);
    }
}
