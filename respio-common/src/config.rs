//! # Configuration Values
//!
//! Purpose: Carry buffer sizing and connection settings as plain, read-only
//! values that can be loaded from JSON/TOML documents.
//!
//! ## Design Principles
//! 1. **Inherited Defaults**: Numeric tuning constants are defaults, not invariants.
//! 2. **Partial Documents**: `#[serde(default)]` lets a config file name only
//!    the fields it overrides.
//! 3. **Validate Once**: `validate` runs at construction time, never on the hot path.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default read page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default size of a freshly allocated outbound block.
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

/// Lower clamp applied to outbound size hints.
pub const DEFAULT_BLOCK_HINT_MIN: usize = 16;

/// Upper clamp applied to outbound size hints.
pub const DEFAULT_BLOCK_HINT_MAX: usize = 128;

/// Buffer and pool sizing shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of one read page.
    pub page_size: usize,
    /// Pages kept by the shared page pool.
    pub page_pool_capacity: usize,
    /// Pages each read buffer keeps privately before using the shared pool.
    pub segment_free_list_depth: usize,
    /// Size of a freshly allocated outbound block.
    pub block_size: usize,
    /// Lower clamp for outbound size hints.
    pub block_hint_min: usize,
    /// Upper clamp for outbound size hints.
    pub block_hint_max: usize,
    /// Arrays kept by the block buffer pool.
    pub block_pool_capacity: usize,
    /// Recycled message objects kept per connection.
    pub message_pool_capacity: usize,
    /// Deepest streaming aggregate nesting the scanner accepts.
    pub max_streaming_depth: u8,
    /// Worker threads for parsers that are not inline-safe (0 = parse inline).
    pub parse_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            page_size: DEFAULT_PAGE_SIZE,
            page_pool_capacity: 64,
            segment_free_list_depth: 2,
            block_size: DEFAULT_BLOCK_SIZE,
            block_hint_min: DEFAULT_BLOCK_HINT_MIN,
            block_hint_max: DEFAULT_BLOCK_HINT_MAX,
            block_pool_capacity: 32,
            message_pool_capacity: 64,
            max_streaming_depth: 64,
            parse_workers: 0,
        }
    }
}

impl EngineConfig {
    /// Checks the sizing invariants the buffers rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::new("page_size must be non-zero"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::new("block_size must be non-zero"));
        }
        if self.block_hint_min > self.block_hint_max {
            return Err(ConfigError::new("block_hint_min exceeds block_hint_max"));
        }
        if self.max_streaming_depth == 0 || self.max_streaming_depth > 64 {
            return Err(ConfigError::new("max_streaming_depth must be within 1..=64"));
        }
        Ok(())
    }

    /// Clamps an outbound size hint into the configured bounds.
    #[inline]
    pub fn clamp_block_hint(&self, hint: usize) -> usize {
        hint.clamp(self.block_hint_min, self.block_hint_max)
    }
}

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Default timeout for blocking waits on a reply.
    pub response_timeout: Option<Duration>,
    /// Treat connections as pub/sub subscribers when framing replies.
    pub pubsub: bool,
    /// Buffer and pool sizing.
    pub engine: EngineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            response_timeout: None,
            pubsub: false,
            engine: EngineConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Checks pool limits and the nested engine config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_total == 0 {
            return Err(ConfigError::new("max_total must be non-zero"));
        }
        if self.max_idle > self.max_total {
            return Err(ConfigError::new("max_idle exceeds max_total"));
        }
        self.engine.validate()
    }
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: &'static str,
}

impl ConfigError {
    fn new(message: &'static str) -> Self {
        ConfigError { message }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_hint_bounds() {
        let config = EngineConfig {
            block_hint_min: 256,
            block_hint_max: 16,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn clamps_hints() {
        let config = EngineConfig::default();
        assert_eq!(config.clamp_block_hint(0), DEFAULT_BLOCK_HINT_MIN);
        assert_eq!(config.clamp_block_hint(64), 64);
        assert_eq!(config.clamp_block_hint(10_000), DEFAULT_BLOCK_HINT_MAX);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"addr":"10.0.0.1:6380","engine":{"page_size":8192}}"#)
                .expect("parse");
        assert_eq!(config.addr, "10.0.0.1:6380");
        assert_eq!(config.engine.page_size, 8192);
        assert_eq!(config.engine.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.max_total, 16);
    }

    #[test]
    fn rejects_idle_above_total() {
        let config = ClientConfig {
            max_idle: 4,
            max_total: 2,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
