//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Where the categorizer keeps its durable state.
#[derive(Debug, Clone)]
pub enum DatabaseTarget {
    /// Local libSQL file.
    Local(PathBuf),
    /// Remote libSQL server (`libsql://...`).
    Remote { url: String, auth_token: SecretString },
}

/// Service configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct CategorizerConfig {
    pub database: DatabaseTarget,
    /// JSON-lines file the consumer tails.
    pub source_path: PathBuf,
    pub health_host: String,
    pub health_port: u16,
    /// Emit a tracing span per health request.
    pub health_log_requests: bool,
    /// Upper bound on a single poll for the next event.
    pub poll_timeout: Duration,
    /// Confidence recorded for rule-sourced results.
    pub rule_confidence: f64,
    /// Minimum confidence for a fallback prediction to be accepted.
    pub fallback_threshold: f64,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    /// Page size for merchant reconciliation.
    pub merchant_batch_size: usize,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseTarget::Local(PathBuf::from("./data/categorizer.db")),
            source_path: PathBuf::from("./data/transactions.jsonl"),
            health_host: "0.0.0.0".to_string(),
            health_port: 8080,
            health_log_requests: false,
            poll_timeout: Duration::from_millis(1000),
            rule_confidence: 0.9,
            fallback_threshold: 0.6,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            merchant_batch_size: 500,
        }
    }
}

impl CategorizerConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Unset keys fall back to [`CategorizerConfig::default`]; set but
    /// unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database = match lookup("CATEGORIZER_DB_URL").filter(|s| !s.trim().is_empty()) {
            Some(url) => DatabaseTarget::Remote {
                url,
                auth_token: SecretString::from(
                    lookup("CATEGORIZER_DB_AUTH_TOKEN").unwrap_or_default(),
                ),
            },
            None => match lookup("CATEGORIZER_DB_PATH") {
                Some(path) => DatabaseTarget::Local(PathBuf::from(path)),
                None => defaults.database,
            },
        };

        let source_path = lookup("CATEGORIZER_SOURCE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.source_path);

        let health_host = lookup("HEALTH_HOST").unwrap_or(defaults.health_host);
        let health_port = parse_or(&lookup, "HEALTH_PORT", defaults.health_port)?;
        let health_log_requests = lookup("HEALTH_LOG_REQUESTS")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.health_log_requests);

        let poll_timeout = Duration::from_millis(parse_or(
            &lookup,
            "CATEGORIZER_POLL_TIMEOUT_MS",
            defaults.poll_timeout.as_millis() as u64,
        )?);

        let rule_confidence = unit_interval(
            "CATEGORIZER_RULE_CONFIDENCE",
            parse_or(&lookup, "CATEGORIZER_RULE_CONFIDENCE", defaults.rule_confidence)?,
        )?;
        let fallback_threshold = unit_interval(
            "CATEGORIZER_FALLBACK_THRESHOLD",
            parse_or(
                &lookup,
                "CATEGORIZER_FALLBACK_THRESHOLD",
                defaults.fallback_threshold,
            )?,
        )?;

        let retry_backoff = Duration::from_millis(parse_or(
            &lookup,
            "CATEGORIZER_RETRY_BACKOFF_MS",
            defaults.retry_backoff.as_millis() as u64,
        )?);
        let retry_backoff_max = Duration::from_millis(parse_or(
            &lookup,
            "CATEGORIZER_RETRY_BACKOFF_MAX_MS",
            defaults.retry_backoff_max.as_millis() as u64,
        )?);
        if retry_backoff > retry_backoff_max {
            return Err(ConfigError::InvalidValue {
                key: "CATEGORIZER_RETRY_BACKOFF_MS".into(),
                message: format!(
                    "initial backoff {retry_backoff:?} exceeds maximum {retry_backoff_max:?}"
                ),
            });
        }

        let merchant_batch_size =
            parse_or(&lookup, "MERCHANT_BATCH_SIZE", defaults.merchant_batch_size)?;
        if merchant_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MERCHANT_BATCH_SIZE".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            database,
            source_path,
            health_host,
            health_port,
            health_log_requests,
            poll_timeout,
            rule_confidence,
            fallback_threshold,
            retry_backoff,
            retry_backoff_max,
            merchant_batch_size,
        })
    }

    /// Socket address string for the health responder.
    pub fn health_addr(&self) -> String {
        format!("{}:{}", self.health_host, self.health_port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn unit_interval(key: &str, value: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside 0.0..=1.0"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<CategorizerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CategorizerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert!((config.rule_confidence - 0.9).abs() < f64::EPSILON);
        assert!((config.fallback_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.merchant_batch_size, 500);
        assert!(matches!(config.database, DatabaseTarget::Local(_)));
    }

    #[test]
    fn remote_url_takes_precedence_over_path() {
        let config = config_from(&[
            ("CATEGORIZER_DB_PATH", "/tmp/local.db"),
            ("CATEGORIZER_DB_URL", "libsql://example.turso.io"),
            ("CATEGORIZER_DB_AUTH_TOKEN", "secret"),
        ])
        .unwrap();
        match config.database {
            DatabaseTarget::Remote { url, auth_token } => {
                assert_eq!(url, "libsql://example.turso.io");
                assert_eq!(auth_token.expose_secret(), "secret");
            }
            other => panic!("expected remote target, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_port_is_rejected() {
        let err = config_from(&[("HEALTH_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HEALTH_PORT"));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        assert!(config_from(&[("CATEGORIZER_FALLBACK_THRESHOLD", "1.5")]).is_err());
        assert!(config_from(&[("CATEGORIZER_RULE_CONFIDENCE", "-0.1")]).is_err());
    }

    #[test]
    fn backoff_bounds_are_checked() {
        let err = config_from(&[
            ("CATEGORIZER_RETRY_BACKOFF_MS", "5000"),
            ("CATEGORIZER_RETRY_BACKOFF_MAX_MS", "1000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("CATEGORIZER_RETRY_BACKOFF_MS"));
    }

    #[test]
    fn log_requests_accepts_truthy_values() {
        assert!(config_from(&[("HEALTH_LOG_REQUESTS", "yes")]).unwrap().health_log_requests);
        assert!(!config_from(&[("HEALTH_LOG_REQUESTS", "0")]).unwrap().health_log_requests);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(config_from(&[("MERCHANT_BATCH_SIZE", "0")]).is_err());
    }
}
