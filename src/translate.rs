//! Turns an inbound `GET /<target>` request into the outbound request the
//! proxy issues on the caller's behalf.
//!
//! The target is read from the raw request path with its leading slashes
//! removed. A target without an explicit scheme is fetched over https; an
//! explicit scheme must be `http` or `https`. The inbound query string is
//! appended verbatim, and only a fixed set of request headers crosses over.
//!
//! The address is fetched as written: the parsed [`Url`] only validates it,
//! so dot segments and host case survive into the outbound request.

use crate::error::ProxyError;
use hyper::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, ORIGIN, RANGE, REFERER, USER_AGENT,
};
use hyper::{HeaderMap, Method, Uri};
use std::fmt;
use url::Url;

/// Request headers copied from the inbound request when present and non-empty.
pub const FORWARDED_HEADERS: [hyper::header::HeaderName; 11] = [
    USER_AGENT,
    COOKIE,
    ACCEPT,
    ACCEPT_ENCODING,
    ACCEPT_LANGUAGE,
    REFERER,
    AUTHORIZATION,
    IF_MODIFIED_SINCE,
    IF_NONE_MATCH,
    RANGE,
    ORIGIN,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else if s.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The upstream URL a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: Scheme,
    pub url: Url,
    raw: String,
    host: String,
}

impl ForwardTarget {
    /// Absolute address as written, scheme included.
    pub fn raw_url(&self) -> &str {
        &self.raw
    }

    /// Host as written in the authority, case preserved, without port.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw_url())
    }
}

/// A fully resolved outbound request. Always bodiless.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub host: String,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl OutboundRequest {
    pub fn get(target: &ForwardTarget, headers: HeaderMap) -> Result<Self, ProxyError> {
        let uri: Uri = target
            .raw_url()
            .parse()
            .map_err(|e: http::uri::InvalidUri| {
                ProxyError::Request(format!("{}: {}", target.raw_url(), e))
            })?;
        Ok(Self {
            method: Method::GET,
            url: target.url.clone(),
            host: target.host.clone(),
            uri,
            headers,
        })
    }
}

pub struct RequestTranslator;

impl RequestTranslator {
    /// Reads the target address out of the inbound request URI.
    ///
    /// Returns `NotFound` when nothing is left after stripping the leading
    /// slashes: the proxy serves no content of its own.
    pub fn extract_target(uri: &Uri) -> Result<String, ProxyError> {
        let stripped = uri.path().trim_start_matches('/').trim();
        if stripped.is_empty() {
            return Err(ProxyError::NotFound);
        }

        match uri.query() {
            Some(query) => Ok(format!("{}?{}", stripped, query)),
            None => Ok(stripped.to_string()),
        }
    }

    /// Resolves a raw address into a target, defaulting to https.
    pub fn normalize_address(address: &str) -> Result<ForwardTarget, ProxyError> {
        let address = address.trim();
        let (scheme, absolute) = match explicit_scheme(address) {
            Some(given) => {
                let scheme = Scheme::parse(given)
                    .ok_or_else(|| ProxyError::UnsupportedScheme(given.to_string()))?;
                (scheme, address.to_string())
            }
            None => (Scheme::Https, format!("https://{}", address)),
        };

        let url = Url::parse(&absolute)
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", absolute, e)))?;
        let parsed_host = url.host_str().unwrap_or_default();
        let host = match authority_host(&absolute) {
            Some(host) if !parsed_host.is_empty() => host,
            _ => return Err(ProxyError::InvalidTarget(format!("{}: missing host", absolute))),
        };
        // Encoded, IDN and numeric-shorthand hosts parse to something else.
        if !host.eq_ignore_ascii_case(parsed_host) {
            return Err(ProxyError::InvalidTarget(format!(
                "{}: ambiguous host {}",
                absolute, host
            )));
        }

        Ok(ForwardTarget {
            scheme,
            host: host.to_string(),
            url,
            raw: absolute,
        })
    }

    /// Copies the forwardable subset of `inbound` into a fresh header map.
    pub fn filter_headers(inbound: &HeaderMap) -> HeaderMap {
        let mut outbound = HeaderMap::new();
        for name in FORWARDED_HEADERS.iter() {
            for value in inbound.get_all(name) {
                if !value.is_empty() {
                    outbound.append(name.clone(), value.clone());
                }
            }
        }
        outbound
    }

    pub fn outbound(target: &ForwardTarget, inbound: &HeaderMap) -> Result<OutboundRequest, ProxyError> {
        OutboundRequest::get(target, Self::filter_headers(inbound))
    }
}

/// Host of an absolute or scheme-less address exactly as written: userinfo
/// and port removed, case kept. IPv6 literals keep their brackets.
pub fn authority_host(address: &str) -> Option<&str> {
    let rest = match explicit_scheme(address) {
        Some(scheme) => &address[scheme.len() + "://".len()..],
        None => address,
    };
    let authority = &rest[..rest.find(['/', '?', '#']).unwrap_or(rest.len())];
    let host_port = match authority.rfind('@') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };
    let host = if host_port.starts_with('[') {
        match host_port.find(']') {
            Some(idx) => &host_port[..=idx],
            None => host_port,
        }
    } else {
        match host_port.find(':') {
            Some(idx) => &host_port[..idx],
            None => host_port,
        }
    };
    (!host.is_empty()).then_some(host)
}

// `scheme://` prefix, if the address starts with one.
fn explicit_scheme(address: &str) -> Option<&str> {
    let idx = address.find("://")?;
    let candidate = &address[..idx];
    let mut chars = candidate.chars();
    let first = chars.next()?;
    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        Some(candidate)
    } else {
        None
    }
}
