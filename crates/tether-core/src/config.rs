//! Thread table configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backoff applied to a worker thread after consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure, in milliseconds.
    pub min_backoff_ms: u64,
    /// Upper bound for the delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Failures in a row before the worker gives up (`None` = never).
    pub max_consecutive_failures: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_consecutive_failures: Some(6),
        }
    }
}

impl BackoffConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Configuration for a `ThreadTable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Number of thread records (default: available parallelism).
    pub num_threads: usize,
    /// Capacity of each thread's request handoff channel.
    pub request_buffer: usize,
    /// Worker failure backoff.
    pub backoff: BackoffConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            request_buffer: 1,
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}: cannot parse {raw:?}"))),
    }
}

impl TableConfig {
    /// Configuration with `num_threads` records and default everything else.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads,
            ..Self::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    ///
    /// Environment variables:
    /// - TETHER_THREADS: number of thread records
    /// - TETHER_REQUEST_BUFFER: request handoff capacity per thread
    /// - TETHER_BACKOFF_MIN_MS: first failure delay
    /// - TETHER_BACKOFF_MAX_MS: delay ceiling
    /// - TETHER_MAX_CONSECUTIVE_FAILURES: failure ceiling ("none" = unlimited)
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(n) = parse_var(&lookup, "TETHER_THREADS")? {
            self.num_threads = n;
        }
        if let Some(n) = parse_var(&lookup, "TETHER_REQUEST_BUFFER")? {
            self.request_buffer = n;
        }
        if let Some(ms) = parse_var(&lookup, "TETHER_BACKOFF_MIN_MS")? {
            self.backoff.min_backoff_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "TETHER_BACKOFF_MAX_MS")? {
            self.backoff.max_backoff_ms = ms;
        }
        if let Some(raw) = lookup("TETHER_MAX_CONSECUTIVE_FAILURES") {
            self.backoff.max_consecutive_failures = if raw.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                parse_var(&lookup, "TETHER_MAX_CONSECUTIVE_FAILURES")?
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the table cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::Config("num_threads must be at least 1".to_string()));
        }
        if self.request_buffer == 0 {
            return Err(Error::Config("request_buffer must be at least 1".to_string()));
        }
        if self.backoff.min_backoff_ms > self.backoff.max_backoff_ms {
            return Err(Error::Config(format!(
                "min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.backoff.min_backoff_ms, self.backoff.max_backoff_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = TableConfig::default();
        assert!(config.num_threads >= 1);
        assert_eq!(config.request_buffer, 1);
        assert_eq!(config.backoff.max_consecutive_failures, Some(6));
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = TableConfig::default()
            .with_overrides(lookup(&[
                ("TETHER_THREADS", "3"),
                ("TETHER_BACKOFF_MIN_MS", "5"),
                ("TETHER_BACKOFF_MAX_MS", "50"),
                ("TETHER_MAX_CONSECUTIVE_FAILURES", "none"),
            ]))
            .unwrap();
        assert_eq!(config.num_threads, 3);
        assert_eq!(config.backoff.min_backoff(), Duration::from_millis(5));
        assert_eq!(config.backoff.max_backoff(), Duration::from_millis(50));
        assert_eq!(config.backoff.max_consecutive_failures, None);
    }

    #[test]
    fn test_bad_override_is_rejected() {
        let err = TableConfig::default()
            .with_overrides(lookup(&[("TETHER_THREADS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        assert!(TableConfig::with_threads(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = TableConfig::with_threads(1);
        config.backoff.min_backoff_ms = 10;
        config.backoff.max_backoff_ms = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"num_threads": 2, "backoff": {{"max_backoff_ms": 300}}}}"#).unwrap();

        let config = TableConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.request_buffer, 1);
        assert_eq!(config.backoff.min_backoff_ms, 100);
        assert_eq!(config.backoff.max_backoff_ms, 300);
    }
}
