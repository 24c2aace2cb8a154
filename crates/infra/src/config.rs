//! Configuration loading and representation.
//!
//! Everything is read from the environment. Only the provider API key is
//! mandatory, and only when the HTTP job provider is actually constructed.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::types::Backoff;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not set")]
    Missing { name: &'static str },

    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-level configuration for the curator service.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// When set, Postgres backs both the durable store and the vector store.
    pub database_url: Option<String>,
    /// Name of this orchestrator instance inside a shared durable store.
    pub scope: String,
    pub provider: ProviderConfig,
    pub callback: CallbackConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            database_url: env_opt("DATABASE_URL"),
            scope: env_or("ORCHESTRATOR_SCOPE", "embeddings"),
            provider: ProviderConfig::from_env()?,
            callback: CallbackConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
        })
    }
}

/// Connection settings for the batch job provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Bound on status/result/create calls.
    pub request_timeout: Duration,
    /// Bound on input uploads, which carry a whole chunk.
    pub upload_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(120),
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_url: env_or("OPENAI_BASE_URL", &defaults.base_url),
            api_key: env_opt("OPENAI_API_KEY"),
            request_timeout: env_secs("PROVIDER_TIMEOUT_SECS", defaults.request_timeout)?,
            upload_timeout: env_secs("PROVIDER_UPLOAD_TIMEOUT_SECS", defaults.upload_timeout)?,
        })
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or(ConfigError::Missing { name: "OPENAI_API_KEY" })
    }
}

/// Downstream consumer settings.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Base URL; notifications are POSTed to `{url}/notify`.
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl CallbackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_opt("CALLBACK_URL"),
            timeout: env_secs("CALLBACK_TIMEOUT_SECS", Self::default().timeout)?,
        })
    }
}

/// Tunables of the batch orchestrator itself.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Model requested for every embedding line.
    pub embedding_model: String,
    /// A chunk is dropped once its retry count exceeds this.
    pub chunk_retry_ceiling: u32,
    /// Pause between two submissions of the drain worker.
    pub inter_item_delay: Duration,
    /// A job is abandoned once its polling retry count exceeds this.
    pub poll_retry_ceiling: u32,
    /// Total immediate delivery attempts before escalating to the ledger.
    pub callback_attempts: u32,
    /// A ledger entry is dropped once its retry count exceeds this.
    pub ledger_retry_ceiling: u32,
    pub callback_backoff: Backoff,
    /// Scalar appended to every embedding before it is written.
    pub freshness_placeholder: Option<f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            embedding_model: "text-embedding-3-small".to_string(),
            chunk_retry_ceiling: 3,
            inter_item_delay: Duration::from_secs(1),
            poll_retry_ceiling: 5,
            callback_attempts: 5,
            ledger_retry_ceiling: 5,
            callback_backoff: Backoff::default(),
            freshness_placeholder: Some(0.0),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            embedding_model: env_or("EMBEDDING_MODEL", &d.embedding_model),
            chunk_retry_ceiling: env_parse("CHUNK_RETRY_CEILING", d.chunk_retry_ceiling)?,
            inter_item_delay: env_millis("INTER_ITEM_DELAY_MS", d.inter_item_delay)?,
            poll_retry_ceiling: env_parse("POLL_RETRY_CEILING", d.poll_retry_ceiling)?,
            callback_attempts: env_parse("CALLBACK_ATTEMPTS", d.callback_attempts)?,
            ledger_retry_ceiling: env_parse("LEDGER_RETRY_CEILING", d.ledger_retry_ceiling)?,
            callback_backoff: Backoff {
                base_delay: env_millis("CALLBACK_BASE_DELAY_MS", d.callback_backoff.base_delay)?,
                max_delay: env_millis("CALLBACK_MAX_DELAY_MS", d.callback_backoff.max_delay)?,
                jitter: env_parse("CALLBACK_JITTER", d.callback_backoff.jitter)?,
            },
            freshness_placeholder: match env_opt("FRESHNESS_PLACEHOLDER") {
                Some(v) if v.eq_ignore_ascii_case("none") => None,
                Some(v) => Some(parse_value("FRESHNESS_PLACEHOLDER", &v)?),
                None => d.freshness_placeholder,
            },
        })
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match env_opt(name) {
        Some(v) => parse_value(name, &v),
        None => Ok(default),
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(name, default_ms).map(Duration::from_millis)
}

fn parse_value<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ceilings() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.chunk_retry_ceiling, 3);
        assert_eq!(cfg.poll_retry_ceiling, 5);
        assert_eq!(cfg.callback_attempts, 5);
        assert_eq!(cfg.ledger_retry_ceiling, 5);
        assert_eq!(cfg.inter_item_delay, Duration::from_secs(1));
    }

    #[test]
    fn parse_value_reports_the_variable() {
        let err = parse_value::<u32>("CHUNK_RETRY_CEILING", "three").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { name: "CHUNK_RETRY_CEILING", .. }
        ));
    }

    #[test]
    fn missing_api_key_is_reported() {
        let cfg = ProviderConfig::default();
        assert_eq!(
            cfg.require_api_key(),
            Err(ConfigError::Missing { name: "OPENAI_API_KEY" })
        );
    }
}
