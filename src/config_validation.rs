//! Startup validation of a loaded [`Config`].
//!
//! Errors stop the server from starting. Warnings and suggestions are
//! reported but do not block.

use crate::config::Config;
use std::collections::HashSet;
use std::net::IpAddr;

/// Findings of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::success();

        Self::validate_allowance(config, &mut result);
        Self::validate_listen(config, &mut result);
        Self::validate_download(config, &mut result);

        result
    }

    fn validate_allowance(config: &Config, result: &mut ValidationResult) {
        if config.allowance.is_empty() {
            result.add_error("No allowance set: at least one hostname is required".to_string());
            return;
        }

        let mut seen = HashSet::new();
        for entry in &config.allowance {
            if let Err(e) = Self::validate_hostname(entry) {
                result.add_error(format!("Invalid allowance entry '{}': {}", entry, e));
                continue;
            }

            if !seen.insert(entry.as_str()) {
                result.add_warning(format!("Duplicate allowance entry '{}'", entry));
            }
        }
    }

    fn validate_listen(config: &Config, result: &mut ValidationResult) {
        let host = config.listen.trim();
        if host.is_empty() {
            result.add_error("Listen address cannot be empty".to_string());
            return;
        }

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.contains(':') && bare.parse::<IpAddr>().is_err() {
            result.add_error(format!(
                "Invalid listen address '{}': expected a host without port, the port is configured separately",
                config.listen
            ));
        }

        if config.port != 0 && config.port < 1024 {
            result.add_warning(format!(
                "Using privileged port {} - may require elevated privileges",
                config.port
            ));
        }

        if bare == "0.0.0.0" || bare == "::" {
            result.add_warning(format!(
                "Binding to all interfaces ({}) exposes the proxy to external networks",
                bare
            ));
        }
    }

    fn validate_download(config: &Config, result: &mut ValidationResult) {
        if config.attempt == 0 {
            result.add_warning("attempt is 0; a single attempt will be made".to_string());
        } else if config.attempt > 5 {
            result.add_suggestion(format!(
                "attempt is {}; consider a lower attempt count to keep failing requests short",
                config.attempt
            ));
        }

        if !config.rate_limit.is_empty() {
            result.add_warning(format!(
                "rate-limit '{}' is accepted but not enforced",
                config.rate_limit
            ));
        }

        let timeouts = [
            ("connect", config.timeout.connect),
            ("tls-handshake", config.timeout.tls_handshake),
            ("response-header", config.timeout.response_header),
            ("overall", config.timeout.overall),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                result.add_warning(format!("timeout.{} is 0; the default applies", name));
            }
        }
    }

    /// An allowance entry is compared to parsed URL hosts, so anything a
    /// host can never contain is rejected.
    fn validate_hostname(entry: &str) -> Result<(), String> {
        if entry.is_empty() {
            return Err("hostname cannot be empty".to_string());
        }
        if entry.chars().any(char::is_whitespace) {
            return Err("hostname cannot contain whitespace".to_string());
        }
        if entry.contains("://") {
            return Err("hostname must not include a scheme".to_string());
        }
        if entry.contains('/') {
            return Err("hostname must not include a path".to_string());
        }
        if entry.contains('@') {
            return Err("hostname must not include user info".to_string());
        }
        if entry.contains(':') && !entry.starts_with('[') {
            return Err("hostname must not include a port".to_string());
        }
        Ok(())
    }
}
