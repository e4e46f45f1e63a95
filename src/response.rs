use crate::body::{self, ProxyBody};
use crate::error::ProxyError;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Builders for the responses the proxy produces itself.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response with custom status and message.
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(body::full(message.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    pub fn method_not_allowed() -> Response<ProxyBody> {
        let mut response = Response::new(body::empty());
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        response
    }

    pub fn not_found() -> Response<ProxyBody> {
        let mut response = Response::new(body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    }

    pub fn access_denied() -> Response<ProxyBody> {
        Self::error(StatusCode::FORBIDDEN, "Access denied")
    }

    /// Maps a per-request failure onto its response. Download failures carry
    /// the underlying error text.
    pub fn from_error(err: &ProxyError) -> Response<ProxyBody> {
        match err {
            ProxyError::MethodNotAllowed(_) => Self::method_not_allowed(),
            ProxyError::NotFound => Self::not_found(),
            ProxyError::AccessDenied(_) => Self::access_denied(),
            other => Self::error(other.status_code(), &other.to_string()),
        }
    }
}
