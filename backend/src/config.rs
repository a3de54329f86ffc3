use std::{fmt::Display, str::FromStr, time::Duration};

use shared::{validation::validate_option_set, OptionId, ValidationError};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_AGGREGATION_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RETRY_BASE_MS: u64 = 100;
pub const DEFAULT_RETRY_CAP_MS: u64 = 5_000;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;
pub const DEFAULT_QUEUE_VISIBILITY_SECS: u64 = 30;
pub const DEFAULT_QUEUE_POLL_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("VOTE_OPTIONS is not set")]
    MissingOptions,
    #[error("Invalid VOTE_OPTIONS: {0}")]
    InvalidOptions(#[from] ValidationError),
    #[error("Invalid {key} value '{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("RETRY_BASE_MS ({base}) exceeds RETRY_CAP_MS ({cap})")]
    BackoffInverted { base: u64, cap: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            cap: Duration::from_millis(DEFAULT_RETRY_CAP_MS),
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub options: Vec<OptionId>,
    pub aggregation_interval: Duration,
    pub retry: RetryPolicy,
    pub subscriber_buffer: usize,
    pub queue_visibility: Duration,
    pub queue_poll: Duration,
}

impl PipelineConfig {
    /// Builds a config with defaults for everything but the ballot.
    pub fn with_options<S: AsRef<str>>(options: &[S]) -> Result<Self, ConfigError> {
        Ok(Self {
            options: validate_option_set(options)?,
            aggregation_interval: Duration::from_millis(DEFAULT_AGGREGATION_INTERVAL_MS),
            retry: RetryPolicy::default(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            queue_visibility: Duration::from_secs(DEFAULT_QUEUE_VISIBILITY_SECS),
            queue_poll: Duration::from_millis(DEFAULT_QUEUE_POLL_MS),
        })
    }

    /// Loads the pipeline settings through `lookup`, which is backed by the
    /// service secret store in production.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_options = lookup("VOTE_OPTIONS").ok_or(ConfigError::MissingOptions)?;
        let options: Vec<&str> = raw_options
            .split(',')
            .filter(|opt| !opt.trim().is_empty())
            .collect();

        let config = Self {
            options: validate_option_set(&options)?,
            aggregation_interval: Duration::from_millis(try_load(
                &lookup,
                "AGGREGATION_INTERVAL_MS",
                DEFAULT_AGGREGATION_INTERVAL_MS,
            )?),
            retry: RetryPolicy {
                base: Duration::from_millis(try_load(&lookup, "RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?),
                cap: Duration::from_millis(try_load(&lookup, "RETRY_CAP_MS", DEFAULT_RETRY_CAP_MS)?),
                max_attempts: try_load(&lookup, "RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS)?,
            },
            subscriber_buffer: try_load(&lookup, "SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)?,
            queue_visibility: Duration::from_secs(try_load(
                &lookup,
                "QUEUE_VISIBILITY_SECS",
                DEFAULT_QUEUE_VISIBILITY_SECS,
            )?),
            queue_poll: Duration::from_millis(try_load(&lookup, "QUEUE_POLL_MS", DEFAULT_QUEUE_POLL_MS)?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation_interval.is_zero() {
            return Err(ConfigError::Zero("AGGREGATION_INTERVAL_MS"));
        }
        if self.retry.base.is_zero() {
            return Err(ConfigError::Zero("RETRY_BASE_MS"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Zero("RETRY_MAX_ATTEMPTS"));
        }
        if self.retry.base > self.retry.cap {
            return Err(ConfigError::BackoffInverted {
                base: self.retry.base.as_millis() as u64,
                cap: self.retry.cap.as_millis() as u64,
            });
        }
        if self.subscriber_buffer == 0 {
            return Err(ConfigError::Zero("SUBSCRIBER_BUFFER"));
        }
        if self.queue_visibility.is_zero() {
            return Err(ConfigError::Zero("QUEUE_VISIBILITY_SECS"));
        }
        if self.queue_poll.is_zero() {
            return Err(ConfigError::Zero("QUEUE_POLL_MS"));
        }
        Ok(())
    }
}

fn try_load<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(value) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return Ok(default);
    };

    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::load(lookup(&[("VOTE_OPTIONS", "tabs, spaces")])).unwrap();
        assert_eq!(config.options.len(), 2);
        assert_eq!(config.options[1].as_str(), "spaces");
        assert_eq!(config.aggregation_interval, Duration::from_secs(1));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.subscriber_buffer, DEFAULT_SUBSCRIBER_BUFFER);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::load(lookup(&[
            ("VOTE_OPTIONS", "a,b,c"),
            ("AGGREGATION_INTERVAL_MS", "250"),
            ("RETRY_BASE_MS", "10"),
            ("RETRY_CAP_MS", "80"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("SUBSCRIBER_BUFFER", "4"),
        ]))
        .unwrap();

        assert_eq!(config.options.len(), 3);
        assert_eq!(config.aggregation_interval, Duration::from_millis(250));
        assert_eq!(config.retry.base, Duration::from_millis(10));
        assert_eq!(config.retry.cap, Duration::from_millis(80));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.subscriber_buffer, 4);
    }

    #[test]
    fn test_fails_fast_without_options() {
        assert!(matches!(PipelineConfig::load(lookup(&[])), Err(ConfigError::MissingOptions)));
        assert!(matches!(
            PipelineConfig::load(lookup(&[("VOTE_OPTIONS", " , ")])),
            Err(ConfigError::InvalidOptions(ValidationError::TooFewOptions))
        ));
        assert!(matches!(
            PipelineConfig::load(lookup(&[("VOTE_OPTIONS", "a,a")])),
            Err(ConfigError::InvalidOptions(ValidationError::DuplicateOption(_)))
        ));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            PipelineConfig::load(lookup(&[("VOTE_OPTIONS", "a,b"), ("SUBSCRIBER_BUFFER", "lots")])),
            Err(ConfigError::InvalidValue { key: "SUBSCRIBER_BUFFER", .. })
        ));
        assert!(matches!(
            PipelineConfig::load(lookup(&[("VOTE_OPTIONS", "a,b"), ("SUBSCRIBER_BUFFER", "0")])),
            Err(ConfigError::Zero("SUBSCRIBER_BUFFER"))
        ));
        assert!(matches!(
            PipelineConfig::load(lookup(&[("VOTE_OPTIONS", "a,b"), ("RETRY_MAX_ATTEMPTS", "0")])),
            Err(ConfigError::Zero("RETRY_MAX_ATTEMPTS"))
        ));
        assert!(matches!(
            PipelineConfig::load(lookup(&[
                ("VOTE_OPTIONS", "a,b"),
                ("RETRY_BASE_MS", "900"),
                ("RETRY_CAP_MS", "100"),
            ])),
            Err(ConfigError::BackoffInverted { base: 900, cap: 100 })
        ));
    }
}
