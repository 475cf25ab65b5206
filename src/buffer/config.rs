//! Buffer Configuration
//!
//! Flush cadence, channel capacity and the optional close deadline.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the aggregation buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Interval between timer-driven flushes (default: 1s)
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Capacity of the submission channel; producers wait when it is full (default: 100)
    pub channel_capacity: usize,
    /// Upper bound on how long `close` waits for the final flush (default: unbounded)
    #[serde(with = "option_duration_millis")]
    pub close_timeout: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            flush_interval: Duration::from_secs(1),
            channel_capacity: 100,
            close_timeout: None,
        }
    }
}

impl BufferConfig {
    /// Configuration for testing (fast flushes, small channel)
    pub fn test() -> Self {
        BufferConfig {
            flush_interval: Duration::from_millis(50),
            channel_capacity: 16,
            close_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Default configuration with the given flush interval
    pub fn with_interval(flush_interval: Duration) -> Self {
        BufferConfig {
            flush_interval,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
