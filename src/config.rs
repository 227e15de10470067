// src/config.rs
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::rabbitmq::errors::{MqError, Result};

/// Opaque declare/bind arguments, forwarded to the broker verbatim.
pub type Arguments = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Topic,
    Fanout,
    Direct,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(MqError::ConfigError(format!(
                "unknown exchange type '{}'",
                other
            ))),
        }
    }
}

/// Connection and topology parameters for one exchange/queue/binding route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub addr: String,
    pub exchange: String,
    #[serde(default)]
    pub exchange_type: ExchangeKind,
    pub queue: String,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub consumer_tag: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub prefetch_size: u32,
    #[serde(default)]
    pub exchange_args: Arguments,
    #[serde(default)]
    pub queue_args: Arguments,
    #[serde(default)]
    pub queue_bind_args: Arguments,
}

pub(crate) fn default_prefetch_count() -> u16 {
    10
}

impl BrokerConfig {
    pub fn new(addr: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            exchange: exchange.into(),
            exchange_type: ExchangeKind::default(),
            queue: queue.into(),
            routing_key: String::new(),
            consumer_tag: String::new(),
            prefetch_count: default_prefetch_count(),
            prefetch_size: 0,
            exchange_args: Arguments::new(),
            queue_args: Arguments::new(),
            queue_bind_args: Arguments::new(),
        }
    }

    pub fn with_exchange_type(mut self, kind: ExchangeKind) -> Self {
        self.exchange_type = kind;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_prefetch(mut self, count: u16, size: u32) -> Self {
        self.prefetch_count = count;
        self.prefetch_size = size;
        self
    }

    pub fn with_exchange_args(mut self, args: Arguments) -> Self {
        self.exchange_args = args;
        self
    }

    pub fn with_queue_args(mut self, args: Arguments) -> Self {
        self.queue_args = args;
        self
    }

    pub fn with_queue_bind_args(mut self, args: Arguments) -> Self {
        self.queue_bind_args = args;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(MqError::ConfigError("addr cannot be empty".to_string()));
        }
        if !(self.addr.starts_with("amqp://") || self.addr.starts_with("amqps://")) {
            return Err(MqError::ConfigError(format!(
                "addr must be an amqp:// or amqps:// URI, got '{}'",
                self.addr
            )));
        }
        if self.exchange.is_empty() {
            return Err(MqError::ConfigError("exchange cannot be empty".to_string()));
        }
        if self.queue.is_empty() {
            return Err(MqError::ConfigError("queue cannot be empty".to_string()));
        }
        Ok(())
    }
}

// Configuration file discovery and loading
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("rabbitmq.json")),
        ("Current directory (alternative)", Path::new("config/rabbitmq.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".rabbitmq.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find rabbitmq.json configuration file. \
         Please create one in the current directory, ./config, or your home directory."
    ))
}

pub fn load_config_from(path: &Path) -> anyhow::Result<BrokerConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: BrokerConfig = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config.validate()?;
    Ok(config)
}

pub fn load_config() -> anyhow::Result<BrokerConfig> {
    let path = find_config_file()?;
    load_config_from(&path)
}
