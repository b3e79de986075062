//! Configuration, grounded on `vendor/nicscheduler`'s per-method element
//! arguments (spec §6.6).

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Static `i mod n` assignment, computed once.
    Rss,
    /// Static assignment that rotates by one bucket every tick.
    RssRr,
    /// Adaptive load-based rebalancing (default).
    RssPlusPlus,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("tick_min_ms ({tick_min_ms}) must not exceed tick_max_ms ({tick_max_ms})")]
    TickMinExceedsMax { tick_min_ms: u64, tick_max_ms: u64 },
    #[error("target_load must be in (0, 1], got {0}")]
    TargetLoadOutOfRange(f64),
    #[error("imbalance_alpha must be in [0, 1], got {0}")]
    ImbalanceAlphaOutOfRange(f64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NicSchedulerConfig {
    pub policy: Policy,
    pub tick_min_ms: u64,
    pub tick_max_ms: u64,
    pub target_load: f64,
    pub threshold: f64,
    pub imbalance_alpha: f64,
    pub dancer: bool,
    pub numa: bool,
    pub autoscale: bool,
}

impl Default for NicSchedulerConfig {
    fn default() -> Self {
        NicSchedulerConfig {
            policy: Policy::RssPlusPlus,
            tick_min_ms: 10,
            tick_max_ms: 1_000,
            target_load: 0.5,
            threshold: 0.1,
            imbalance_alpha: 1.0,
            dancer: true,
            numa: false,
            autoscale: true,
        }
    }
}

impl NicSchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_min_ms > self.tick_max_ms {
            return Err(ConfigError::TickMinExceedsMax {
                tick_min_ms: self.tick_min_ms,
                tick_max_ms: self.tick_max_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.target_load) || self.target_load == 0.0 {
            return Err(ConfigError::TargetLoadOutOfRange(self.target_load));
        }
        if !(0.0..=1.0).contains(&self.imbalance_alpha) {
            return Err(ConfigError::ImbalanceAlphaOutOfRange(self.imbalance_alpha));
        }
        Ok(())
    }

    pub fn tick_min(&self) -> Duration {
        Duration::from_millis(self.tick_min_ms)
    }

    pub fn tick_max(&self) -> Duration {
        Duration::from_millis(self.tick_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NicSchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn swapped_tick_bounds_rejected() {
        let mut cfg = NicSchedulerConfig::default();
        cfg.tick_min_ms = 2_000;
        assert!(cfg.validate().is_err());
    }
}
