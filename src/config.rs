use std::env;

use serde::Deserialize;

use crate::audit::{DEFAULT_MAX_IN_FLIGHT, DEFAULT_QUEUE_CAPACITY};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid trace configuration: {0}")]
    Env(#[from] envy::Error),
}

/// Options the tracer reads at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Persist an audit record for every traced stage.
    pub audit_logs: bool,
    /// Payload field holding the correlation id, instead of `request_id`.
    pub request_id_alias: Option<String>,
    /// Audit records queued before new ones are dropped.
    pub audit_queue_capacity: usize,
    /// Audit sink writes allowed to run at once.
    pub audit_max_in_flight: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            audit_logs: false,
            request_id_alias: None,
            audit_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            audit_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl TraceConfig {
    /// Reads `TRACE_AUDIT_LOGS`, `TRACE_REQUEST_ID_ALIAS`,
    /// `TRACE_AUDIT_QUEUE_CAPACITY` and `TRACE_AUDIT_MAX_IN_FLIGHT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::prefixed("TRACE_").from_env()?)
    }

    /// Same as [`TraceConfig::from_env`], over an explicit set of variables.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("TRACE_").from_iter(vars)?)
    }
}

/// Where and how logs leave the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP collector, e.g. `http://localhost:4317`. Spans and metrics are
    /// only exported when set.
    pub otlp_endpoint: Option<String>,
    /// Emit log lines as JSON instead of the human readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            otlp_endpoint: None,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// The service name can be configured using the env var `SERVICE_NAME`,
    /// otherwise the cargo name will be used. The collector is read from
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` and `LOG_FORMAT=json` switches to JSON
    /// output.
    pub fn from_env() -> Self {
        TelemetryConfig {
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string()),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unset() {
        let config = TraceConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config, TraceConfig::default());
        assert!(!config.audit_logs);
    }

    #[test]
    fn reads_prefixed_vars() {
        let config = TraceConfig::from_vars(vars(&[
            ("TRACE_AUDIT_LOGS", "true"),
            ("TRACE_REQUEST_ID_ALIAS", "trace_ref"),
            ("TRACE_AUDIT_QUEUE_CAPACITY", "64"),
            ("AUDIT_LOGS", "false"),
        ]))
        .unwrap();

        assert!(config.audit_logs);
        assert_eq!(config.request_id_alias.as_deref(), Some("trace_ref"));
        assert_eq!(config.audit_queue_capacity, 64);
        assert_eq!(config.audit_max_in_flight, DEFAULT_MAX_IN_FLIGHT);
    }

    #[test]
    fn rejects_malformed_flag() {
        let result = TraceConfig::from_vars(vars(&[("TRACE_AUDIT_LOGS", "sometimes")]));
        assert!(matches!(result, Err(ConfigError::Env(_))));
    }
}
