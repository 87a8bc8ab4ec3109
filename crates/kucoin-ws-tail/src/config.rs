/*
[INPUT]:  YAML feed file
[OUTPUT]: Validated tail configuration and engine settings
[POS]:    Configuration layer - feed setup
[UPDATE]: When adding new configuration options
*/

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use kucoin_ws_adapter::{BackoffStrategy, MarketFeed, WsClientConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the tail tool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TailConfig {
    /// Feeds to open, one engine each
    pub feeds: Vec<FeedConfig>,
    /// Engine tunables shared by every feed
    #[serde(default)]
    pub ws: WsSettings,
}

/// One feed and the topics to follow on it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    /// Feed identifier used in logs
    pub id: String,
    pub feed: MarketFeed,
    pub topics: Vec<String>,
    /// REST base URL override for the token request
    #[serde(default)]
    pub rest_base_url: Option<String>,
}

/// Engine tunables in milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsSettings {
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// -1 keeps retrying forever
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i32,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Switches to exponential backoff capped at this value
    #[serde(default)]
    pub max_reconnect_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_reconnect_duration_ms: Option<u64>,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_message_buffer: usize,
    #[serde(default = "default_write_buffer")]
    pub write_message_buffer: usize,
    #[serde(default = "default_resubscribe_attempts")]
    pub auto_resubscribe_max_attempts: u32,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            reconnect: default_reconnect(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_interval_ms: None,
            max_reconnect_duration_ms: None,
            dial_timeout_ms: default_dial_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            read_message_buffer: default_read_buffer(),
            write_message_buffer: default_write_buffer(),
            auto_resubscribe_max_attempts: default_resubscribe_attempts(),
        }
    }
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_attempts() -> i32 {
    -1
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_dial_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_read_buffer() -> usize {
    1024
}

fn default_write_buffer() -> usize {
    256
}

fn default_resubscribe_attempts() -> u32 {
    3
}

impl WsSettings {
    pub fn to_client_config(&self) -> WsClientConfig {
        let backoff = match self.max_reconnect_interval_ms {
            Some(max) => BackoffStrategy::Exponential {
                max_interval: Duration::from_millis(max),
            },
            None => BackoffStrategy::Fixed,
        };
        WsClientConfig {
            reconnect: self.reconnect,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            backoff,
            max_reconnect_duration: self.max_reconnect_duration_ms.map(Duration::from_millis),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            read_message_buffer: self.read_message_buffer,
            write_message_buffer: self.write_message_buffer,
            auto_resubscribe_max_attempts: self.auto_resubscribe_max_attempts,
        }
    }
}

impl TailConfig {
    /// Load and validate configuration from a YAML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("parse yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            bail!("at least one feed is required");
        }

        let mut ids = HashSet::new();
        for feed in &self.feeds {
            if !ids.insert(feed.id.as_str()) {
                bail!("duplicate feed id: {}", feed.id);
            }
            if feed.feed.is_private() {
                bail!(
                    "feed {} uses private feed {}; private feeds need request signing",
                    feed.id,
                    feed.feed
                );
            }
            if feed.topics.is_empty() {
                bail!("feed {} lists no topics", feed.id);
            }
            if feed.topics.iter().any(|topic| topic.trim().is_empty()) {
                bail!("feed {} has an empty topic", feed.id);
            }
        }

        self.ws
            .to_client_config()
            .validate()
            .context("invalid ws settings")
    }
}
