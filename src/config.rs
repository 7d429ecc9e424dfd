//! Configuration management for token buckets and the throttle tool.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::TokenBucket;

/// Settings for a single token bucket.
///
/// Exactly one of `rate` and `fill_interval_ms` must be given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens the bucket holds
    pub capacity: i64,

    /// Fill rate in tokens per second
    #[serde(default)]
    pub rate: Option<f64>,

    /// Milliseconds between single-token fills
    #[serde(default)]
    pub fill_interval_ms: Option<u64>,
}

impl BucketConfig {
    /// Build a bucket from these settings.
    pub fn build(&self) -> Result<TokenBucket> {
        match (self.rate, self.fill_interval_ms) {
            (Some(rate), None) => TokenBucket::with_rate(rate, self.capacity),
            (None, Some(ms)) => TokenBucket::new(Duration::from_millis(ms), self.capacity),
            (Some(_), Some(_)) => Err(RateLimitError::Config(
                "bucket sets both rate and fill_interval_ms".to_string(),
            )),
            (None, None) => Err(RateLimitError::Config(
                "bucket needs either rate or fill_interval_ms".to_string(),
            )),
        }
    }
}

/// Configuration for the `throttle` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Bucket limiting the byte flow
    pub bucket: BucketConfig,

    /// Bytes paid for by one token
    #[serde(default = "default_bytes_per_token")]
    pub bytes_per_token: usize,

    /// Size of each read from the input
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_bytes_per_token() -> usize {
    1
}

fn default_buffer_size() -> usize {
    32 * 1024
}

impl ThrottleConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RateLimitError::Config(format!("Failed to parse throttle config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.bytes_per_token == 0 {
            return Err(RateLimitError::Config("bytes_per_token must be > 0".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(RateLimitError::Config("buffer_size must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rate_config() {
        let yaml = r#"
bucket:
  capacity: 4096
  rate: 1024
bytes_per_token: 16
buffer_size: 512
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.bucket.capacity, 4096);
        assert_eq!(config.bucket.rate, Some(1024.0));
        assert_eq!(config.bucket.fill_interval_ms, None);
        assert_eq!(config.bytes_per_token, 16);
        assert_eq!(config.buffer_size, 512);

        let bucket = config.bucket.build().unwrap();
        assert_eq!(bucket.capacity(), 4096);
        assert!((bucket.rate() - 1024.0).abs() / 1024.0 <= 0.01);
    }

    #[test]
    fn test_parse_interval_config_with_defaults() {
        let yaml = r#"
bucket:
  capacity: 10
  fill_interval_ms: 250
"#;
        let config = ThrottleConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.bytes_per_token, 1);
        assert_eq!(config.buffer_size, 32 * 1024);

        let bucket = config.bucket.build().unwrap();
        assert_eq!(bucket.fill_interval(), Duration::from_millis(250));
        assert_eq!(bucket.quantum(), 1);
    }

    #[test]
    fn test_bucket_needs_exactly_one_fill_setting() {
        let both = BucketConfig {
            capacity: 10,
            rate: Some(5.0),
            fill_interval_ms: Some(100),
        };
        assert!(matches!(both.build(), Err(RateLimitError::Config(_))));

        let neither = BucketConfig {
            capacity: 10,
            rate: None,
            fill_interval_ms: None,
        };
        assert!(matches!(neither.build(), Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_bucket_config_propagates_invalid_parameters() {
        let config = BucketConfig {
            capacity: 0,
            rate: None,
            fill_interval_ms: Some(100),
        };
        assert!(matches!(config.build(), Err(RateLimitError::InvalidParameter(_))));

        let config = BucketConfig {
            capacity: 10,
            rate: None,
            fill_interval_ms: Some(0),
        };
        assert!(matches!(config.build(), Err(RateLimitError::InvalidParameter(_))));
    }

    #[test]
    fn test_invalid_yaml() {
        let result = ThrottleConfig::from_yaml("bucket: [not, a, map]");
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let yaml = r#"
bucket:
  capacity: 10
  rate: 5
bytes_per_token: 0
"#;
        assert!(matches!(ThrottleConfig::from_yaml(yaml), Err(RateLimitError::Config(_))));

        let yaml = r#"
bucket:
  capacity: 10
  rate: 5
buffer_size: 0
"#;
        assert!(matches!(ThrottleConfig::from_yaml(yaml), Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ThrottleConfig::from_file("/nonexistent/throttle.yaml");
        assert!(matches!(result, Err(RateLimitError::Io(_))));
    }
}
