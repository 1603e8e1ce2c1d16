//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of parallel executors in a pooled worker.
pub const DEFAULT_POOL_EXECUTORS: usize = 4;

/// Default bounded wait of a continuous worker's dequeue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Order in which a pooled worker harvests sub-task results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestOrder {
    /// Wait on each result in submission order. A slow early sub-task
    /// holds back progress for later ones that already finished.
    #[default]
    Submission,
    /// Take results as they complete, remapped to their submission index.
    Completion,
}

impl std::str::FromStr for HarvestOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "submission" => Ok(Self::Submission),
            "completion" => Ok(Self::Completion),
            other => Err(ConfigError::InvalidValue {
                key: "harvest_order".to_string(),
                message: format!("expected `submission` or `completion`, got `{other}`"),
            }),
        }
    }
}

/// Pooled worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of parallel executors (K).
    pub executors: usize,
    pub harvest_order: HarvestOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            executors: DEFAULT_POOL_EXECUTORS,
            harvest_order: HarvestOrder::default(),
        }
    }
}

impl PoolConfig {
    /// Read `STUDIO_JOBS_POOL_EXECUTORS` and `STUDIO_JOBS_HARVEST_ORDER`,
    /// falling back to defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let executors = std::env::var("STUDIO_JOBS_POOL_EXECUTORS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.executors);

        let harvest_order = std::env::var("STUDIO_JOBS_HARVEST_ORDER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.harvest_order);

        Self {
            executors,
            harvest_order,
        }
    }

    pub fn with_executors(mut self, executors: usize) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_harvest_order(mut self, order: HarvestOrder) -> Self {
        self.harvest_order = order;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executors == 0 {
            return Err(ConfigError::InvalidValue {
                key: "executors".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Executors actually used for a batch of `n` sub-tasks.
    pub fn effective_executors(&self, n: usize) -> usize {
        self.executors.min(n).max(1)
    }
}

/// Continuous worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousConfig {
    /// Bounded wait for the next job before polling for cancellation.
    pub poll_interval: Duration,
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ContinuousConfig {
    /// Read `STUDIO_JOBS_POLL_INTERVAL_MS`.
    pub fn from_env() -> Self {
        let poll_interval = std::env::var("STUDIO_JOBS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self { poll_interval }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Everything the binary needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub pool: PoolConfig,
    pub continuous: ContinuousConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig::from_env(),
            continuous: ContinuousConfig::from_env(),
        }
    }

    /// Read from the environment and validate.
    pub fn load() -> crate::error::Result<Self> {
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.continuous.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.executors, DEFAULT_POOL_EXECUTORS);
        assert_eq!(config.pool.harvest_order, HarvestOrder::Submission);
        assert_eq!(config.continuous.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn zero_executors_rejected() {
        let err = PoolConfig::default().with_executors(0).validate().unwrap_err();
        assert!(err.to_string().contains("executors"));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let config = ContinuousConfig::default().with_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn effective_executors_capped_by_batch_size() {
        let config = PoolConfig::default().with_executors(8);
        assert_eq!(config.effective_executors(3), 3);
        assert_eq!(config.effective_executors(20), 8);
        assert_eq!(config.effective_executors(0), 1);
    }

    #[test]
    fn harvest_order_parses() {
        assert_eq!("Completion".parse::<HarvestOrder>().unwrap(), HarvestOrder::Completion);
        assert_eq!(" submission ".parse::<HarvestOrder>().unwrap(), HarvestOrder::Submission);
        assert!("random".parse::<HarvestOrder>().is_err());
    }
}
