// src/env.rs
use std::env;

use dotenv::dotenv;

use crate::config::{default_prefetch_count, Arguments, BrokerConfig, ExchangeKind};
use crate::rabbitmq::errors::{MqError, Result};

pub const DEFAULT_PREFIX: &str = "MQ_";

impl BrokerConfig {
    /// Load the broker configuration from `MQ_*` environment variables,
    /// reading a `.env` file first if one is present.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_prefix(DEFAULT_PREFIX)
    }

    pub fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Keys are the
    /// upper-case field names (`ADDR`, `EXCHANGE_TYPE`, ...) behind `prefix`.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{}{}", prefix, key))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| {
                MqError::ConfigError(format!("missing value of {}{}", prefix, key))
            })
        };

        let config = BrokerConfig {
            addr: required("ADDR")?,
            exchange: required("EXCHANGE")?,
            exchange_type: match get("EXCHANGE_TYPE") {
                Some(kind) => kind.parse()?,
                None => ExchangeKind::default(),
            },
            queue: required("QUEUE")?,
            routing_key: get("ROUTING_KEY").unwrap_or_default(),
            consumer_tag: get("CONSUMER_TAG").unwrap_or_default(),
            prefetch_count: match get("PREFETCH_COUNT") {
                Some(val) => val.parse()?,
                None => default_prefetch_count(),
            },
            prefetch_size: match get("PREFETCH_SIZE") {
                Some(val) => val.parse()?,
                None => 0,
            },
            exchange_args: parse_arguments(prefix, "EXCHANGE_ARGS", get("EXCHANGE_ARGS"))?,
            queue_args: parse_arguments(prefix, "QUEUE_ARGS", get("QUEUE_ARGS"))?,
            queue_bind_args: parse_arguments(prefix, "QUEUE_BIND_ARGS", get("QUEUE_BIND_ARGS"))?,
        };

        config.validate()?;
        Ok(config)
    }
}

fn parse_arguments(prefix: &str, key: &str, raw: Option<String>) -> Result<Arguments> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| {
            MqError::ConfigError(format!("{}{} must be a JSON object: {}", prefix, key, e))
        }),
        None => Ok(Arguments::new()),
    }
}
