//! Control-plane configuration: the defaults, validation rules, and
//! structure behind every key in the `[dlq]`, `[ordering]`, and
//! `[subscription]` tables of a Mahavishnu config file.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{OrderingStrategy, RetryPolicy};

/// Dead-letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub default_retry_policy: RetryPolicy,
    pub default_max_retries: u32,
    pub retry_processor_enabled: bool,
    pub retry_interval_seconds: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            default_retry_policy: RetryPolicy::Exponential,
            default_max_retries: 3,
            retry_processor_enabled: true,
            retry_interval_seconds: 60,
        }
    }
}

/// Task ordering engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrderingConfig {
    pub default_strategy: OrderingStrategy,
    pub urgent_deadline_days: i64,
    pub approaching_deadline_days: i64,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            default_strategy: OrderingStrategy::Balanced,
            urgent_deadline_days: 3,
            approaching_deadline_days: 7,
        }
    }
}

/// Subscription gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub ping_interval_seconds: u64,
    pub delivery_queue_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            ping_interval_seconds: 20,
            delivery_queue_size: 1_024,
        }
    }
}

/// The full control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub dlq: DlqConfig,
    pub ordering: OrderingConfig,
    pub subscription: SubscriptionConfig,
}

impl Config {
    /// Parse a TOML document into a `Config`, falling back to defaults for
    /// any table or key the document omits.
    pub fn from_toml_str(text: &str) -> Result<Self, ValidationError> {
        toml::from_str(text).map_err(|e| ValidationError::Other {
            message: format!("invalid configuration: {e}"),
        })
    }

    /// Resolve one key's final value from the chain described by the
    /// gateway/CLI: an explicit override (a CLI flag or environment
    /// variable, already parsed by the caller) takes precedence over the
    /// value loaded from a config file, which in turn takes precedence
    /// over the hardcoded default already present on `self`.
    pub fn with_override<T>(file_value: T, explicit: Option<T>) -> T {
        explicit.unwrap_or(file_value)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dlq.max_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "dlq.max_size",
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        if self.dlq.retry_interval_seconds == 0 {
            return Err(ValidationError::OutOfRange {
                field: "dlq.retry_interval_seconds",
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        if self.ordering.urgent_deadline_days < 0 {
            return Err(ValidationError::OutOfRange {
                field: "ordering.urgent_deadline_days",
                value: self.ordering.urgent_deadline_days,
                min: 0,
                max: i64::MAX,
            });
        }
        if self.ordering.approaching_deadline_days < self.ordering.urgent_deadline_days {
            return Err(ValidationError::Other {
                message: "ordering.approaching_deadline_days must be >= ordering.urgent_deadline_days"
                    .to_string(),
            });
        }
        if self.subscription.delivery_queue_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "subscription.delivery_queue_size",
                value: 0,
                min: 1,
                max: i64::MAX,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dlq.max_size, 10_000);
        assert_eq!(config.subscription.delivery_queue_size, 1_024);
    }

    #[test]
    fn parses_partial_toml_filling_in_defaults() {
        let text = r#"
            [dlq]
            max_size = 500

            [ordering]
            default_strategy = "priority_first"
        "#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.dlq.max_size, 500);
        assert_eq!(config.dlq.default_retry_policy, RetryPolicy::Exponential);
        assert_eq!(config.ordering.default_strategy, OrderingStrategy::PriorityFirst);
        assert_eq!(config.subscription.ping_interval_seconds, 20);
    }

    #[test]
    fn rejects_zero_max_size() {
        let mut config = Config::default();
        config.dlq.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_approaching_window_smaller_than_urgent_window() {
        let mut config = Config::default();
        config.ordering.approaching_deadline_days = 1;
        config.ordering.urgent_deadline_days = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_override_wins_over_file_value() {
        assert_eq!(Config::with_override(10, Some(20)), 20);
        assert_eq!(Config::with_override(10, None), 10);
    }
}
