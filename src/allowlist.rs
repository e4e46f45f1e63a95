use crate::error::ProxyError;
use crate::translate::authority_host;
use std::collections::HashSet;

/// Static set of hostnames the proxy may fetch from.
///
/// Matching is exact and case-sensitive against the host as written in the
/// target's authority; userinfo, ports and paths never take part in the
/// comparison.
#[derive(Debug, Clone)]
pub struct Allowlist {
    hosts: HashSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(hosts: I) -> Result<Self, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hosts: HashSet<String> = hosts.into_iter().map(Into::into).collect();
        if hosts.is_empty() {
            return Err(ProxyError::Config("no allowance set".to_string()));
        }
        Ok(Self { hosts })
    }

    pub fn permits(&self, hostname: &str) -> bool {
        self.hosts.contains(hostname)
    }

    /// Checks the host of a raw address, with or without a scheme.
    pub fn permits_url(&self, address: &str) -> bool {
        authority_host(address).is_some_and(|host| self.permits(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
