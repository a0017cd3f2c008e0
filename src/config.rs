//! Scheduler configuration.

use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Longest single wait handed to the platform layer.
pub const MAX_POLL_WAIT: Duration = Duration::from_secs(1_000_000);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Readiness events collected per wait.
    pub events_capacity: usize,
    /// Upper bound on how long one step may block, even with no timer due.
    pub max_poll_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            events_capacity: 128,
            max_poll_wait: MAX_POLL_WAIT,
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn max_poll_wait(mut self, wait: Duration) -> Self {
        self.config.max_poll_wait = wait;
        self
    }

    pub fn build(self) -> Result<SchedulerConfig> {
        if self.config.events_capacity == 0 {
            return Err(SchedulerError::InvalidConfiguration {
                field: "events_capacity",
                reason: "must be greater than 0",
            });
        }
        if self.config.max_poll_wait > MAX_POLL_WAIT {
            return Err(SchedulerError::InvalidConfiguration {
                field: "max_poll_wait",
                reason: "must not exceed 1,000,000 seconds",
            });
        }
        Ok(self.config)
    }
}
