use serde::Deserialize;
use std::time::Duration;

use crate::{BufferError, Result};

/// Tuning for the segment buffer.
///
/// Both linger windows are debounce delays measured from the most recent
/// write to a segment. The TTL of every stored key is
/// `long_linger + ttl_margin`, which bounds how long an abandoned segment
/// can occupy the store.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    /// Delay after a root span was written
    pub short_linger_secs: u64,
    /// Delay after a child span was written
    pub long_linger_secs: u64,
    /// Extra lifetime on top of the long linger before the store reclaims a key
    pub ttl_margin_secs: u64,
    /// Number of deadline queues
    pub num_shards: u32,
    /// Upper bound of segments returned per shard by one flush
    pub max_flush_segments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            short_linger_secs: 10,
            long_linger_secs: 60,
            ttl_margin_secs: 300,
            num_shards: 1,
            max_flush_segments: 500,
        }
    }
}

impl BufferConfig {
    pub fn short_linger(&self) -> Duration {
        Duration::from_secs(self.short_linger_secs)
    }

    pub fn long_linger(&self) -> Duration {
        Duration::from_secs(self.long_linger_secs)
    }

    pub fn segment_ttl(&self) -> Duration {
        Duration::from_secs(self.long_linger_secs.saturating_add(self.ttl_margin_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.short_linger_secs == 0 {
            return Err(BufferError::Config("short_linger_secs must be positive".to_string()));
        }
        if self.long_linger_secs < self.short_linger_secs {
            return Err(BufferError::Config(format!(
                "long_linger_secs ({}) must not be below short_linger_secs ({})",
                self.long_linger_secs, self.short_linger_secs
            )));
        }
        if self.num_shards == 0 {
            return Err(BufferError::Config("num_shards must be at least 1".to_string()));
        }
        if self.max_flush_segments == 0 {
            return Err(BufferError::Config("max_flush_segments must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = BufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.short_linger(), Duration::from_secs(10));
        assert_eq!(config.long_linger(), Duration::from_secs(60));
        assert!(config.segment_ttl() > config.long_linger());
    }

    #[test]
    fn test_validate_rejects_inverted_lingers() {
        let config = BufferConfig {
            short_linger_secs: 30,
            long_linger_secs: 10,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BufferError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        for config in [
            BufferConfig { short_linger_secs: 0, ..Default::default() },
            BufferConfig { num_shards: 0, ..Default::default() },
            BufferConfig { max_flush_segments: 0, ..Default::default() },
        ] {
            assert!(config.validate().is_err(), "{:?} should be rejected", config);
        }
    }
}
