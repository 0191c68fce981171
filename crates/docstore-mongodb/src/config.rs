//! Client configuration: connection URI and per-step timeouts

use docstore_common::{Result, StoreError};
use std::time::Duration;

/// Environment variable holding the connection URI
pub const URI_ENV: &str = "MONGODB_URI";
pub const CONNECT_TIMEOUT_ENV: &str = "MONGODB_CONNECT_TIMEOUT_SECS";
pub const PING_TIMEOUT_ENV: &str = "MONGODB_PING_TIMEOUT_SECS";
pub const OPERATION_TIMEOUT_ENV: &str = "MONGODB_OPERATION_TIMEOUT_SECS";
pub const CURSOR_TIMEOUT_ENV: &str = "MONGODB_CURSOR_TIMEOUT_SECS";

/// Upper bounds for each step of a scoped operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Opening the connection; also bounds the release (default: 10s)
    pub connect: Duration,
    /// Liveness check against the primary (default: 5s)
    pub ping: Duration,
    /// The single operation, or issuing the query for a cursor read (default: 5s)
    pub operation: Duration,
    /// Draining a cursor for multi-result reads (default: 30s)
    pub cursor: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            ping: Duration::from_secs(5),
            operation: Duration::from_secs(5),
            cursor: Duration::from_secs(30),
        }
    }
}

/// Connection settings shared by every call a client makes
#[derive(Debug, Clone)]
pub struct ClientConfig {
    uri: String,
    timeouts: Timeouts,
    app_name: Option<String>,
}

impl ClientConfig {
    /// Create a configuration for `uri` with default timeouts
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            timeouts: Timeouts::default(),
            app_name: None,
        }
    }

    /// Read the configuration from `MONGODB_URI` and the optional
    /// `MONGODB_*_TIMEOUT_SECS` overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`], reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let uri = lookup(URI_ENV)
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| StoreError::Configuration(format!("{} is not set", URI_ENV)))?;

        let defaults = Timeouts::default();
        let timeouts = Timeouts {
            connect: secs_var(&lookup, CONNECT_TIMEOUT_ENV)?.unwrap_or(defaults.connect),
            ping: secs_var(&lookup, PING_TIMEOUT_ENV)?.unwrap_or(defaults.ping),
            operation: secs_var(&lookup, OPERATION_TIMEOUT_ENV)?.unwrap_or(defaults.operation),
            cursor: secs_var(&lookup, CURSOR_TIMEOUT_ENV)?.unwrap_or(defaults.cursor),
        };

        Ok(Self::new(uri).with_timeouts(timeouts))
    }

    /// Replace the step timeouts
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Application name reported in server logs
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }
}

fn secs_var<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(0) => Err(StoreError::Configuration(format!("{} must be positive", key))),
            Ok(secs) => Ok(Some(Duration::from_secs(secs))),
            Err(e) => Err(StoreError::Configuration(format!(
                "{} is not a whole number of seconds: {}",
                key, e
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_timeouts() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect, Duration::from_secs(10));
        assert_eq!(timeouts.ping, Duration::from_secs(5));
        assert_eq!(timeouts.operation, Duration::from_secs(5));
        assert_eq!(timeouts.cursor, Duration::from_secs(30));
    }

    #[test]
    fn test_new_keeps_uri() {
        let config = ClientConfig::new("mongodb://localhost:27017");
        assert_eq!(config.uri(), "mongodb://localhost:27017");
        assert_eq!(config.timeouts(), Timeouts::default());
        assert!(config.app_name().is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let timeouts = Timeouts {
            connect: Duration::from_secs(20),
            ..Default::default()
        };
        let config = ClientConfig::new("mongodb://db:27017")
            .with_timeouts(timeouts)
            .with_app_name("inventory");
        assert_eq!(config.timeouts().connect, Duration::from_secs(20));
        assert_eq!(config.timeouts().cursor, Duration::from_secs(30));
        assert_eq!(config.app_name(), Some("inventory"));
    }

    #[test]
    fn test_from_lookup_requires_uri() {
        let err = ClientConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));

        let err = ClientConfig::from_lookup(lookup_from(&[(URI_ENV, "  ")])).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            (URI_ENV, "mongodb://localhost:27017"),
            (CONNECT_TIMEOUT_ENV, "20"),
            (CURSOR_TIMEOUT_ENV, "60"),
        ]))
        .unwrap();
        assert_eq!(config.uri(), "mongodb://localhost:27017");
        assert_eq!(config.timeouts().connect, Duration::from_secs(20));
        assert_eq!(config.timeouts().ping, Duration::from_secs(5));
        assert_eq!(config.timeouts().cursor, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeouts() {
        let err = ClientConfig::from_lookup(lookup_from(&[
            (URI_ENV, "mongodb://localhost:27017"),
            (PING_TIMEOUT_ENV, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));

        let err = ClientConfig::from_lookup(lookup_from(&[
            (URI_ENV, "mongodb://localhost:27017"),
            (OPERATION_TIMEOUT_ENV, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }
}
