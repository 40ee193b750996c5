use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{
    DEFAULT_MAX_RETRIES, DEFAULT_OUTCOME_CHANNEL_CAPACITY, DEFAULT_RPC_REPLY_PREFIX,
    DEFAULT_RPC_TIMEOUT_MS,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value} could not be parsed: {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Retry ceiling for messages published without `max_retries`
    pub default_max_retries: u32,
    /// Wait used by `request` when the caller passes no timeout
    pub default_rpc_timeout: Duration,
    /// None = unbounded
    pub max_queue_depth: Option<usize>,
    pub outcome_channel_capacity: usize,
    /// Reply topics are `<prefix>.<correlation id>`
    pub rpc_reply_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            max_queue_depth: None,
            outcome_channel_capacity: DEFAULT_OUTCOME_CHANNEL_CAPACITY,
            rpc_reply_prefix: DEFAULT_RPC_REPLY_PREFIX.to_string(),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let max_queue_depth: usize = parse_var("BUS_MAX_QUEUE_DEPTH", "0")?;

        let config = Self {
            default_max_retries: parse_var(
                "BUS_DEFAULT_MAX_RETRIES",
                &DEFAULT_MAX_RETRIES.to_string(),
            )?,
            default_rpc_timeout: Duration::from_millis(parse_var(
                "BUS_RPC_TIMEOUT_MS",
                &DEFAULT_RPC_TIMEOUT_MS.to_string(),
            )?),
            max_queue_depth: (max_queue_depth > 0).then_some(max_queue_depth),
            outcome_channel_capacity: parse_var(
                "BUS_OUTCOME_CHANNEL_CAPACITY",
                &DEFAULT_OUTCOME_CHANNEL_CAPACITY.to_string(),
            )?,
            rpc_reply_prefix: env::var("BUS_RPC_REPLY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RPC_REPLY_PREFIX.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_retries == 0 {
            return Err(ConfigError::Invalid(
                "default_max_retries must be at least 1".to_string(),
            ));
        }
        if self.outcome_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outcome_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.rpc_reply_prefix.is_empty() || self.rpc_reply_prefix.contains('*') {
            return Err(ConfigError::Invalid(format!(
                "rpc_reply_prefix '{}' must be a non-empty topic without wildcards",
                self.rpc_reply_prefix
            )));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    value.parse().map_err(|e: T::Err| ConfigError::Parse {
        key: key.to_string(),
        value,
        reason: e.to_string(),
    })
}
