//! Scan configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::context::Variables;
use crate::enums::InternalVariablePolicy;
use crate::error::ExecError;
use crate::logging::LogConfig;

/// Prefix of the environment variables read by [`ScanConfig::merge_env`].
pub const ENV_PREFIX: &str = "PROBEKIT_";

/// Scan-wide settings. Every field has a default, so an empty document is a
/// valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Worker-pool size: (target, template) runs in flight at once.
    pub concurrency: usize,

    /// Requests in flight across the whole scan.
    pub max_in_flight: usize,

    /// Requests in flight per template.
    pub template_concurrency: usize,

    /// Requests per second; 0 disables rate limiting.
    pub rate_limit: u32,

    /// Transport retries after the first attempt.
    pub retries: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Deadline for a single request, in seconds.
    pub timeout_secs: u64,

    /// How long to wait for out-of-band callbacks after dispatch, in seconds.
    pub interaction_wait_secs: u64,

    /// Resolver used by DNS requests that name none.
    pub dns_resolver: String,

    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,

    /// Default number of bytes read back by network requests.
    pub network_read_size: usize,

    /// Whether values from internal extractors appear in result records.
    pub internal_variables: InternalVariablePolicy,

    /// Stop every Request Block at its first matching request.
    pub stop_at_first_match: bool,

    /// Scan-wide variables seeded into every run after the target bindings.
    pub variables: BTreeMap<String, String>,

    pub logging: LogConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            max_in_flight: 150,
            template_concurrency: 25,
            rate_limit: 150,
            retries: 1,
            backoff_base_ms: 100,
            backoff_max_ms: 5000,
            timeout_secs: 10,
            interaction_wait_secs: 5,
            dns_resolver: String::from("1.1.1.1:53"),
            follow_redirects: false,
            max_redirects: 10,
            user_agent: format!("probekit/{}", env!("CARGO_PKG_VERSION")),
            network_read_size: 2048,
            internal_variables: InternalVariablePolicy::Hide,
            stop_at_first_match: false,
            variables: BTreeMap::new(),
            logging: LogConfig::default(),
        }
    }
}

impl ScanConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecError::config(format!("failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ExecError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_saphyr::from_str(content)
            .map_err(|e| ExecError::config(format!("failed to parse config: {}", e)))
    }

    /// Overrides fields from `PROBEKIT_*` environment variables. Values that
    /// do not parse are ignored.
    pub fn merge_env(self) -> Self {
        self.merge_from(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Same as [`ScanConfig::merge_env`] with an arbitrary lookup, keyed by
    /// the variable name without prefix.
    pub fn merge_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        if let Some(n) = parsed(&lookup, "CONCURRENCY") {
            self.concurrency = n;
        }
        if let Some(n) = parsed(&lookup, "MAX_IN_FLIGHT") {
            self.max_in_flight = n;
        }
        if let Some(n) = parsed(&lookup, "TEMPLATE_CONCURRENCY") {
            self.template_concurrency = n;
        }
        if let Some(n) = parsed(&lookup, "RATE_LIMIT") {
            self.rate_limit = n;
        }
        if let Some(n) = parsed(&lookup, "RETRIES") {
            self.retries = n;
        }
        if let Some(n) = parsed(&lookup, "TIMEOUT_SECS") {
            self.timeout_secs = n;
        }
        if let Some(n) = parsed(&lookup, "INTERACTION_WAIT_SECS") {
            self.interaction_wait_secs = n;
        }
        if let Some(val) = lookup("DNS_RESOLVER") {
            self.dns_resolver = val;
        }
        if let Some(b) = parsed(&lookup, "FOLLOW_REDIRECTS") {
            self.follow_redirects = b;
        }
        if let Some(val) = lookup("USER_AGENT") {
            self.user_agent = val;
        }
        if let Some(val) = lookup("INTERNAL_VARIABLES") {
            match val.trim().to_ascii_lowercase().as_str() {
                "hide" => self.internal_variables = InternalVariablePolicy::Hide,
                "report" => self.internal_variables = InternalVariablePolicy::Report,
                _ => {}
            }
        }
        if let Some(b) = parsed(&lookup, "STOP_AT_FIRST_MATCH") {
            self.stop_at_first_match = b;
        }

        // Logging
        if let Some(val) = lookup("LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(format) = lookup("LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.logging.format = format;
        }

        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn interaction_wait(&self) -> Duration {
        Duration::from_secs(self.interaction_wait_secs)
    }

    /// The scan-wide variables as bindings.
    pub fn global_variables(&self) -> Variables {
        let mut vars = Variables::new();
        for (name, value) in &self.variables {
            vars.set(name, value.clone());
        }
        vars
    }
}
